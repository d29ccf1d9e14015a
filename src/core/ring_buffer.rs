//! Lock-Free Single-Producer Single-Consumer (SPSC) Ring Buffer
//!
//! Lamport queue with acquire/release ordering on the indices. The buffer is
//! only reachable through a [`Producer`] / [`Consumer`] pair, and both halves
//! take `&mut self`, so there is never more than one writer per index.
//!
//! The multiplexer uses it to hand freshly accepted connections from the
//! accept thread to the read-loop thread without taking a lock.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One slot of the ring
#[repr(C, align(64))] // cache line alignment avoids false sharing between slots
struct Slot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Padding for cache line isolation (64 bytes on x86-64)
#[repr(C, align(64))]
struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

#[repr(C)]
struct RingBuffer<T, const N: usize> {
    // producer side
    head: CacheLinePadded<AtomicUsize>,
    // consumer side
    tail: CacheLinePadded<AtomicUsize>,
    buffer: Box<[Slot<T>]>,
    mask: usize,
}

// SAFETY: the producer half is the only writer of `head` and of the slot it
// points at, the consumer half is the only writer of `tail` and the only
// reader of initialised slots. Acquire/release on the indices publishes slot
// contents between the two threads.
unsafe impl<T: Send, const N: usize> Send for RingBuffer<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for RingBuffer<T, N> {}

impl<T, const N: usize> RingBuffer<T, N> {
    fn new() -> Self {
        assert!(N > 0 && N.is_power_of_two(), "N must be power of 2");

        let mut buffer = Vec::with_capacity(N);
        for _ in 0..N {
            buffer.push(Slot::new());
        }

        Self {
            head: CacheLinePadded::new(AtomicUsize::new(0)),
            tail: CacheLinePadded::new(AtomicUsize::new(0)),
            buffer: buffer.into_boxed_slice(),
            mask: N - 1,
        }
    }

    /// Must only be called by the producer half.
    #[inline]
    fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.value.load(Ordering::Relaxed);
        let tail = self.tail.value.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= N {
            return Err(value);
        }

        let slot = &self.buffer[head & self.mask];

        // SAFETY: the slot is outside [tail, head), so the consumer is not reading it
        unsafe {
            (*slot.data.get()).write(value);
        }

        self.head
            .value
            .store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Must only be called by the consumer half.
    #[inline]
    fn pop(&self) -> Option<T> {
        let tail = self.tail.value.load(Ordering::Relaxed);
        let head = self.head.value.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let slot = &self.buffer[tail & self.mask];

        // SAFETY: the slot is inside [tail, head), written and published by the producer
        let value = unsafe { (*slot.data.get()).assume_init_read() };

        self.tail
            .value
            .store(tail.wrapping_add(1), Ordering::Release);

        Some(value)
    }

    #[inline]
    fn len(&self) -> usize {
        let head = self.head.value.load(Ordering::Acquire);
        let tail = self.tail.value.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

impl<T, const N: usize> Drop for RingBuffer<T, N> {
    fn drop(&mut self) {
        // both halves are gone, so draining here races with nobody
        while self.pop().is_some() {}
    }
}

/// Writing half of the hand-off queue.
pub struct Producer<T, const N: usize> {
    ring: Arc<RingBuffer<T, N>>,
}

/// Reading half of the hand-off queue.
pub struct Consumer<T, const N: usize> {
    ring: Arc<RingBuffer<T, N>>,
}

/// Creates a bounded SPSC queue. `N` must be a power of two.
///
/// # Panics
/// Panics if `N` is zero or not a power of two.
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(RingBuffer::new());
    (
        Producer { ring: ring.clone() },
        Consumer { ring },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes `value`, handing it back when the queue is full.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), T> {
        self.ring.push(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.len() >= N
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.ring.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }
}
