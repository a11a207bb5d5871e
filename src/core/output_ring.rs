//! Per-shell bounded buffer of output that has not yet been shipped to the
//! server.

/// Hard cap on unshipped output per shell.
pub const RING_CAPACITY: usize = 10 * 1024;

/// Bounded byte buffer that keeps the most recent output.
///
/// Appends that push the buffer past [`RING_CAPACITY`] truncate from the
/// front, so the newest bytes always survive. Truncation is byte-exact and
/// may land inside a multi-byte UTF-8 sequence; [`OutputRing::read`] decodes
/// lossily, so a split sequence surfaces as a replacement character rather
/// than an error.
#[derive(Debug, Default)]
pub struct OutputRing {
    buf: Vec<u8>,
}

impl OutputRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes, keeping only the trailing [`RING_CAPACITY`] bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > RING_CAPACITY {
            let excess = self.buf.len() - RING_CAPACITY;
            self.buf.drain(..excess);
        }
    }

    /// Returns a copy of the current contents as a string.
    pub fn read(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}
