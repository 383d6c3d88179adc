//! Bounded FIFO byte queue used for each pump direction.
//!
//! The queue never grows past its capacity. A producer offered more than the
//! remaining space is told how much was taken and keeps the rest; that
//! partial acceptance is the backpressure signal.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct IoBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl IoBuffer {
    pub fn new(capacity: usize) -> Self {
        IoBuffer {
            data: VecDeque::with_capacity(capacity),
            capacity,
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

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Free space left before the queue refuses input
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Append as much of `bytes` as fits; returns the number accepted.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.remaining());
        self.data.extend(&bytes[..accepted]);
        accepted
    }

    /// The oldest contiguous run of queued bytes.
    ///
    /// May be shorter than [`len`](Self::len) when the queue wraps; call
    /// again after [`consume`](Self::consume) to get the rest.
    pub fn front(&self) -> &[u8] {
        let (head, tail) = self.data.as_slices();
        if head.is_empty() {
            tail
        } else {
            head
        }
    }

    /// Drop `n` bytes from the front of the queue.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Hand queued bytes to `sink` until it takes nothing or the queue is
    /// empty. `sink` returns how many bytes of the offered slice it took; a
    /// partial take is followed by an offer of the rest. Returns the total
    /// taken.
    pub fn drain_into<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        let mut total = 0;
        while !self.is_empty() {
            let front = self.front();
            let offered = front.len();
            let taken = sink(front).min(offered);
            self.consume(taken);
            total += taken;
            if taken == 0 {
                break;
            }
        }
        total
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
