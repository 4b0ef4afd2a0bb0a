//! Grow-only message buffers.
//!
//! The codec reuses a small set of buffers across frames instead of
//! allocating per message. Growth reallocates and copies; capacity is never
//! given back, and the tracked data length never exceeds it.

/// Reusable byte buffer with an explicit data length.
#[derive(Debug, Default)]
pub(crate) struct MsgBuffer {
    buf: Vec<u8>,
    data_len: usize,
}

impl MsgBuffer {
    /// Create an empty buffer.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make sure at least `size` bytes are addressable, preserving existing
    /// content. Never shrinks.
    pub(crate) fn reserve_len(&mut self, size: usize) {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
    }

    /// Addressable capacity in bytes.
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Full addressable backing slice.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Full addressable backing slice, read-only.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The valid data prefix.
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[..self.data_len]
    }

    /// Length of the valid data prefix.
    pub(crate) fn data_len(&self) -> usize {
        self.data_len
    }

    /// Mark the first `len` bytes as valid data. `len` must not exceed the
    /// addressable capacity.
    pub(crate) fn set_data_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.data_len = len.min(self.buf.len());
    }

    /// Drop the valid data without releasing capacity.
    pub(crate) fn clear_data(&mut self) {
        self.data_len = 0;
    }

    /// Replace the content with a copy of `src`.
    pub(crate) fn assign(&mut self, src: &[u8]) {
        self.reserve_len(src.len());
        self.buf[..src.len()].copy_from_slice(src);
        self.data_len = src.len();
    }
}
