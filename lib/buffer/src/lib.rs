//! Fixed-capacity ring buffers for the multiplexor's per-object I/O.
//!
//! Grounded on the chunked queue in `byte_queue.rs` (push-at-head,
//! pop-at-tail) and the `BufferState` bitflags in `shared_buf.rs`, but
//! collapsed into a single fixed-capacity, wrap-around buffer: the
//! multiplexor's objects never need the chunk-growth behavior the
//! teacher's variable-length queue provides, and a hard capacity is
//! exactly what "ring buffer size is configuration-derived" calls for.

use std::collections::VecDeque;

use bitflags::bitflags;

bitflags! {
    /// Readiness bits for a single object's buffer pair, mirrored into the
    /// tpoll interest set by the multiplexor loop.
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BufferState: u8 {
        /// There is data waiting to be read out of the buffer.
        const READABLE = 0b0000_0001;
        /// There is room to enqueue more bytes.
        const WRITABLE = 0b0000_0010;
        /// The buffer is completely empty.
        const EMPTY = 0b0000_0100;
    }
}

/// A fixed-size, wrap-around byte ring.
///
/// `enqueue` never blocks and never grows the buffer: once `capacity` bytes
/// are queued, further writes drop the *oldest* unread bytes (spec §4.A's
/// overrun policy) rather than refuse the write or grow unbounded. A console
/// that is ignored by every reader must never be able to stall the daemon.
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Set once by `enqueue` when an overrun drops bytes, cleared by
    /// `take_overrun` so the caller can log once per burst instead of once
    /// per dropped byte.
    overrun_pending: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0, "ring buffer capacity must be non-zero");
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            overrun_pending: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn space_available(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Queue `bytes` for later draining. If the buffer would overflow its
    /// capacity, the oldest bytes are discarded first so that the newest
    /// bytes are always retained. Returns `true` if any byte was dropped.
    pub fn enqueue(&mut self, bytes: &[u8]) -> bool {
        let mut dropped = false;

        // if a single write is larger than capacity, only its tail can ever
        // fit; drop the rest up front rather than thrash push/pop below.
        let bytes = if bytes.len() > self.capacity {
            dropped = true;
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            dropped = true;
            for _ in 0..overflow.min(self.data.len()) {
                self.data.pop_front();
            }
        }

        self.data.extend(bytes.iter().copied());
        if dropped {
            self.overrun_pending = true;
        }
        dropped
    }

    /// Returns and clears the overrun flag. Callers use this to log a
    /// single warning per overrun burst rather than flooding the log.
    pub fn take_overrun(&mut self) -> bool {
        std::mem::take(&mut self.overrun_pending)
    }

    /// A contiguous, non-copying view of the readable bytes at the front of
    /// the buffer. May be shorter than `len()` if the data wraps internally;
    /// callers that need everything should loop `dequeue_view` /
    /// `advance` until the buffer is empty.
    pub fn dequeue_view(&self) -> &[u8] {
        self.data.as_slices().0
    }

    /// Consumes `n` bytes from the front of the buffer (must be `<= len()`).
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.data.len(), "advance past end of buffer");
        self.data.drain(..n);
    }

    pub fn state(&self) -> BufferState {
        let mut state = BufferState::empty();
        state.set(BufferState::READABLE, !self.is_empty());
        state.set(BufferState::WRITABLE, self.space_available() > 0);
        state.set(BufferState::EMPTY, self.is_empty());
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let mut rb = RingBuffer::new(16);
        assert!(!rb.enqueue(b"hello"));
        assert_eq!(rb.dequeue_view(), b"hello");
        rb.advance(5);
        assert!(rb.is_empty());
    }

    #[test]
    fn overrun_drops_oldest() {
        let mut rb = RingBuffer::new(4);
        assert!(!rb.enqueue(b"ABCD"));
        assert!(rb.enqueue(b"EF"));
        assert!(rb.take_overrun());
        assert!(!rb.take_overrun());
        // oldest two bytes (A, B) were dropped to make room for E, F
        assert_eq!(rb.dequeue_view(), b"CDEF");
    }

    #[test]
    fn oversized_write_keeps_newest_tail() {
        let mut rb = RingBuffer::new(3);
        assert!(rb.enqueue(b"ABCDEFG"));
        assert_eq!(rb.dequeue_view(), b"EFG");
    }

    #[test]
    fn wrap_around_view_may_split() {
        let mut rb = RingBuffer::new(8);
        rb.enqueue(b"XXXXXX");
        rb.advance(6);
        rb.enqueue(b"ABCDEF");
        // drain piecewise regardless of how many contiguous slices it takes
        let mut out = Vec::new();
        while !rb.is_empty() {
            let view = rb.dequeue_view();
            let n = view.len();
            out.extend_from_slice(view);
            rb.advance(n);
        }
        assert_eq!(out, b"ABCDEF");
    }

    #[test]
    fn buffer_state_bits() {
        let mut rb = RingBuffer::new(4);
        assert_eq!(rb.state(), BufferState::WRITABLE | BufferState::EMPTY);
        rb.enqueue(b"A");
        assert_eq!(rb.state(), BufferState::READABLE | BufferState::WRITABLE);
        rb.enqueue(b"BCD");
        assert_eq!(rb.state(), BufferState::READABLE);
    }
}
