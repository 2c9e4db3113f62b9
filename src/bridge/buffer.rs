//! Bounded replay buffer for output produced while detached

use std::collections::VecDeque;

/// Byte-bounded FIFO; when full, the oldest bytes are dropped first
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    /// Create a buffer holding at most `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append a chunk, evicting from the front to stay within capacity
    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }

        let chunk = if chunk.len() > self.capacity {
            let skip = chunk.len() - self.capacity;
            self.dropped += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend(chunk);
    }

    /// Take the buffered bytes, leaving the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    /// Buffered byte count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum buffered bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes evicted since creation
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }
}
