//! Bounded byte ring for worker stderr capture.

use std::collections::VecDeque;

/// Fixed-capacity byte buffer that retains the newest bytes.
///
/// Worker stderr flows through this so the manager can fingerprint an
/// allocator failure after exit without ever buffering more than the
/// capture cap.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    buf: VecDeque<u8>,
}

impl RingBuffer {
    /// Create a ring with the given capacity in bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity),
        }
    }

    /// Append bytes, discarding the oldest on overflow.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive anyway.
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    /// Retained bytes as lossy UTF-8.
    #[must_use]
    pub fn to_text(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Number of retained bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` when nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
