//! Fixed-capacity per-connection buffers.
//!
//! Each connection owns one `ReadBuffer` and one `WriteBuffer`, both sized
//! to hold a single maximum-length frame. Capacity never grows, which caps
//! memory per connection.

/// Bytes received from the peer but not yet consumed as a complete frame.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    /// Bytes currently filled at the front of `data`.
    filled: usize,
}

impl ReadBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Buffered bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Free space after the buffered bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Writable tail for the next socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Commit `n` bytes that were read into `spare_mut()`.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advance past capacity");
        self.filled += n;
    }

    /// Discard the first `n` buffered bytes, shifting the rest to the front.
    pub fn consume_prefix(&mut self, n: usize) {
        debug_assert!(n <= self.filled, "consume past filled length");
        let n = n.min(self.filled);
        if n < self.filled {
            self.data.copy_within(n..self.filled, 0);
        }
        self.filled -= n;
    }
}

/// An encoded response waiting to be sent.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Box<[u8]>,
    /// Bytes of response loaded into `data`.
    filled: usize,
    /// Bytes of the response already written to the socket.
    sent: usize,
}

impl WriteBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            sent: 0,
        }
    }

    /// Whole buffer, for encoding the next response in place.
    ///
    /// The previous response must be fully flushed first.
    pub fn space_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_flushed(), "response still in flight");
        &mut self.data
    }

    /// Mark the first `n` bytes of `space_mut()` as a response to send.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.data.len(), "commit past capacity");
        self.filled = n.min(self.data.len());
        self.sent = 0;
    }

    /// Bytes not yet written to the socket.
    pub fn unsent(&self) -> &[u8] {
        &self.data[self.sent..self.filled]
    }

    /// Record that `n` more bytes were written.
    pub fn mark_sent(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.filled, "sent past filled length");
        self.sent = (self.sent + n).min(self.filled);
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    /// True once every loaded byte has been sent.
    pub fn is_flushed(&self) -> bool {
        self.sent == self.filled
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(buf: &mut ReadBuffer, bytes: &[u8]) {
        buf.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        buf.advance(bytes.len());
    }

    #[test]
    fn test_read_buffer_fill_and_consume() {
        let mut buf = ReadBuffer::new(8);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.remaining(), 8);

        append(&mut buf, b"hello");
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(buf.remaining(), 3);

        buf.consume_prefix(2);
        assert_eq!(buf.filled(), b"llo");
        assert_eq!(buf.remaining(), 5);

        buf.consume_prefix(3);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.spare_mut().len(), 8);
    }

    #[test]
    fn test_read_buffer_full() {
        let mut buf = ReadBuffer::new(4);
        append(&mut buf, b"abcd");
        assert!(buf.is_full());
        assert_eq!(buf.remaining(), 0);
        assert!(buf.spare_mut().is_empty());

        buf.consume_prefix(1);
        assert!(!buf.is_full());
        assert_eq!(buf.filled(), b"bcd");
    }

    #[test]
    fn test_read_buffer_consumed_bytes_not_reread() {
        let mut buf = ReadBuffer::new(16);
        append(&mut buf, b"firstsecond");
        buf.consume_prefix(5);
        append(&mut buf, b"!");
        assert_eq!(buf.filled(), b"second!");
    }

    #[test]
    fn test_write_buffer_partial_sends() {
        let mut buf = WriteBuffer::new(16);
        assert!(buf.is_flushed());

        buf.space_mut()[..6].copy_from_slice(b"abcdef");
        buf.commit(6);
        assert_eq!(buf.len(), 6);
        assert!(!buf.is_flushed());
        assert_eq!(buf.unsent(), b"abcdef");

        buf.mark_sent(4);
        assert_eq!(buf.unsent(), b"ef");
        assert!(!buf.is_flushed());

        buf.mark_sent(2);
        assert!(buf.is_flushed());
        assert!(buf.unsent().is_empty());

        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.space_mut().len(), 16);
    }
}
