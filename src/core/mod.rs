//! Core module: lock-free building blocks shared by the network loops
//!
//! - Lock-Free: the hand-off queue uses atomics only, no Mutex/RwLock
//! - No-Allocation: slots are pre-allocated at construction

pub mod ring_buffer;

pub use ring_buffer::{channel, Consumer, Producer};
