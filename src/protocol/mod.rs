//! Protocol Layer: line framing for the demo applications
//!
//! The core delivers raw chunks; message boundaries are an application
//! concern. This layer uses newline-terminated text.

mod line;

pub use line::{LineBuffer, LineEncoder, LINE_TERMINATOR};
