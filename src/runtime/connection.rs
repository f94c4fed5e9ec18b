//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its stream, a read buffer and a single-response
//! write buffer. At most one response is in flight per connection: a
//! request is only serviced once the previous response has been fully
//! written, which keeps per-connection memory fixed and preserves response
//! order for pipelined requests.

use crate::protocols::frame::MAX_FRAME;
use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::request::{process_frame, ProcessResult};
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use tracing::{debug, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for request bytes.
    Request,
    /// Flushing the buffered response.
    Response,
    /// Finished; the event loop closes and removes the connection.
    End,
}

/// A single client connection over any non-blocking stream.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the `Request` state with empty buffers.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::Request,
            read_buf: ReadBuffer::new(MAX_FRAME),
            write_buf: WriteBuffer::new(MAX_FRAME),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Readiness this connection waits for in its current state.
    ///
    /// Error and hang-up conditions are always reported by the poller.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Request => Some(Interest::READABLE),
            ConnState::Response => Some(Interest::WRITABLE),
            ConnState::End => None,
        }
    }

    /// Drive the state machine after a readiness notification.
    pub fn handle_io(&mut self) {
        match self.state {
            ConnState::Request => self.on_readable(),
            ConnState::Response => self.on_writable(),
            ConnState::End => {}
        }
    }

    /// Drain the socket, servicing every complete frame as it arrives.
    pub fn on_readable(&mut self) {
        while self.try_fill_buffer() {}
    }

    /// Flush the pending response, then resume with buffered input.
    pub fn on_writable(&mut self) {
        self.flush();
        if self.state == ConnState::Request {
            // Frames already buffered don't produce another readiness event.
            self.process_buffered();
            self.on_readable();
        }
    }

    /// One read from the socket. Returns true if reading should continue.
    fn try_fill_buffer(&mut self) -> bool {
        if self.state != ConnState::Request {
            return false;
        }
        debug_assert!(!self.read_buf.is_full(), "read buffer full in Request");
        if self.read_buf.is_full() {
            return false;
        }

        let n = loop {
            match self.stream.read(self.read_buf.spare_mut()) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    debug!(error = %e, "Read error");
                    self.state = ConnState::End;
                    return false;
                }
            }
        };

        if n == 0 {
            debug!("EOF");
            self.state = ConnState::End;
            return false;
        }

        self.read_buf.advance(n);
        trace!(len = n, buffered = self.read_buf.len(), "Read");

        self.process_buffered();
        self.state == ConnState::Request
    }

    fn process_buffered(&mut self) {
        while self.try_one_request() {}
    }

    /// Service one buffered frame. Returns true if another may follow.
    fn try_one_request(&mut self) -> bool {
        if self.state != ConnState::Request {
            return false;
        }

        match process_frame(self.read_buf.filled(), self.write_buf.space_mut()) {
            ProcessResult::NeedData => false,
            ProcessResult::Error(e) => {
                warn!(error = %e, "Protocol violation, closing connection");
                self.state = ConnState::End;
                false
            }
            ProcessResult::Response {
                consumed,
                response_len,
            } => {
                self.read_buf.consume_prefix(consumed);
                self.write_buf.commit(response_len);
                self.state = ConnState::Response;
                self.flush();
                self.state == ConnState::Request
            }
        }
    }

    fn flush(&mut self) {
        while self.try_flush_buffer() {}
    }

    /// One write to the socket. Returns true if writing should continue.
    fn try_flush_buffer(&mut self) -> bool {
        let n = loop {
            match self.stream.write(self.write_buf.unsent()) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    debug!(error = %e, "Write error");
                    self.state = ConnState::End;
                    return false;
                }
            }
        };

        if n == 0 {
            debug!("Write returned 0");
            self.state = ConnState::End;
            return false;
        }

        self.write_buf.mark_sent(n);
        if self.write_buf.is_flushed() {
            trace!(len = self.write_buf.len(), "Response sent");
            self.write_buf.clear();
            self.state = ConnState::Request;
            return false;
        }
        true
    }
}

/// Registry of active connections using slab allocation.
///
/// The slab key is the connection identity. Keys are reused after removal,
/// always for a freshly constructed entry.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the rejected entry if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Result<usize, T> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, handing ownership back to the caller.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame::codec::encode;
    use crate::protocols::frame::MAX_MSG;
    use std::collections::VecDeque;

    /// What the next `write` call does.
    enum WriteStep {
        Accept(usize),
        Block,
        Interrupted,
        Fail,
        Zero,
    }

    /// In-memory stream: scripted reads, recorded writes.
    ///
    /// An empty read script reports `WouldBlock`; an empty write script
    /// accepts everything.
    #[derive(Default)]
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<WriteStep>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn push_read(&mut self, bytes: &[u8]) {
            self.reads.push_back(Ok(bytes.to_vec()));
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(Ok(chunk[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.writes.pop_front() {
                None => buf.len(),
                Some(WriteStep::Accept(n)) => n.min(buf.len()),
                Some(WriteStep::Block) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(WriteStep::Interrupted) => return Err(io::ErrorKind::Interrupted.into()),
                Some(WriteStep::Fail) => return Err(io::ErrorKind::BrokenPipe.into()),
                Some(WriteStep::Zero) => 0,
            };
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn() -> Connection<ScriptedStream> {
        Connection::new(ScriptedStream::default())
    }

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .flat_map(|p| encode(p).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_initial_state() {
        let c = conn();
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.interest(), Some(Interest::READABLE));
    }

    #[test]
    fn test_echo_single_frame() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"hello"]));

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, frames(&[b"hello"]));
    }

    #[test]
    fn test_echo_empty_and_max_payload() {
        let big = vec![7u8; MAX_MSG];
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b""]));
        c.stream_mut().push_read(&frames(&[&big]));

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, frames(&[b"", &big]));
    }

    #[test]
    fn test_pipelined_frames_answered_in_order() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"one", b"two", b"three"]));

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(
            c.stream_mut().written,
            frames(&[b"one", b"two", b"three"])
        );
    }

    #[test]
    fn test_fragmented_frame() {
        let wire = frames(&[b"fragmented"]);
        let mut c = conn();

        c.stream_mut().push_read(&wire[..4]);
        c.handle_io();
        assert_eq!(c.state(), ConnState::Request);
        assert!(c.stream_mut().written.is_empty());

        c.stream_mut().push_read(&wire[4..8]);
        c.handle_io();
        assert!(c.stream_mut().written.is_empty());

        c.stream_mut().push_read(&wire[8..]);
        c.handle_io();
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, wire);
    }

    #[test]
    fn test_oversize_frame_closes_without_response() {
        let mut c = conn();
        let header = ((MAX_MSG + 1) as u32).to_le_bytes();
        c.stream_mut().push_read(&header);

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
        assert_eq!(c.interest(), None);
        assert!(c.stream_mut().written.is_empty());
    }

    #[test]
    fn test_oversize_after_valid_frame() {
        let mut wire = frames(&[b"ok"]);
        wire.extend_from_slice(&((MAX_MSG + 1) as u32).to_le_bytes());
        let mut c = conn();
        c.stream_mut().push_read(&wire);

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
        assert_eq!(c.stream_mut().written, frames(&[b"ok"]));
    }

    #[test]
    fn test_eof_ends_connection() {
        let mut c = conn();
        c.stream_mut().push_read(b"");

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
    }

    #[test]
    fn test_read_error_ends_connection() {
        let mut c = conn();
        c.stream_mut()
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
    }

    #[test]
    fn test_interrupted_read_retried() {
        let mut c = conn();
        c.stream_mut()
            .reads
            .push_back(Err(io::ErrorKind::Interrupted.into()));
        c.stream_mut().push_read(&frames(&[b"again"]));

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, frames(&[b"again"]));
    }

    #[test]
    fn test_interrupted_write_retried() {
        let wire = frames(&[b"retry"]);
        let mut c = conn();
        c.stream_mut().push_read(&wire);
        c.stream_mut().writes.push_back(WriteStep::Interrupted);
        c.stream_mut().writes.push_back(WriteStep::Accept(2));
        c.stream_mut().writes.push_back(WriteStep::Interrupted);

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.interest(), Some(Interest::READABLE));
        assert_eq!(c.stream_mut().written, wire);
    }

    #[test]
    fn test_partial_write_then_resume() {
        let wire = frames(&[b"partial"]);
        let mut c = conn();
        c.stream_mut().push_read(&wire);
        c.stream_mut().writes.push_back(WriteStep::Accept(3));
        c.stream_mut().writes.push_back(WriteStep::Block);

        c.handle_io();

        assert_eq!(c.state(), ConnState::Response);
        assert_eq!(c.interest(), Some(Interest::WRITABLE));
        assert_eq!(c.stream_mut().written, &wire[..3]);

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, wire);
    }

    #[test]
    fn test_blocked_write_holds_pipelined_frames() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"first", b"second"]));
        c.stream_mut().writes.push_back(WriteStep::Block);

        c.handle_io();

        // First response queued, second frame still buffered.
        assert_eq!(c.state(), ConnState::Response);
        assert!(c.stream_mut().written.is_empty());

        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, frames(&[b"first", b"second"]));
    }

    #[test]
    fn test_writable_resumes_reading_socket() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"a"]));
        c.stream_mut().writes.push_back(WriteStep::Block);
        c.handle_io();
        assert_eq!(c.state(), ConnState::Response);

        // More input arrived while the response was blocked.
        c.stream_mut().push_read(&frames(&[b"b"]));
        c.handle_io();

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream_mut().written, frames(&[b"a", b"b"]));
    }

    #[test]
    fn test_write_error_ends_connection() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"x"]));
        c.stream_mut().writes.push_back(WriteStep::Fail);

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
    }

    #[test]
    fn test_zero_write_ends_connection() {
        let mut c = conn();
        c.stream_mut().push_read(&frames(&[b"x"]));
        c.stream_mut().writes.push_back(WriteStep::Zero);

        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
    }

    #[test]
    fn test_end_is_terminal() {
        let mut c = conn();
        c.stream_mut().push_read(b"");
        c.handle_io();
        assert_eq!(c.state(), ConnState::End);

        c.stream_mut().push_read(&frames(&[b"late"]));
        c.handle_io();

        assert_eq!(c.state(), ConnState::End);
        assert!(c.stream_mut().written.is_empty());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(conn()).ok().unwrap();
        let id2 = registry.insert(conn()).ok().unwrap();

        // At capacity
        assert!(registry.insert(conn()).is_err());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.iter().count(), 2);
        assert!(registry.get_mut(id2).is_some());

        registry.remove(id1);
        assert!(registry.get_mut(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_reused_id_starts_clean() {
        let mut registry = ConnectionRegistry::new(4);

        let id = registry.insert(conn()).ok().unwrap();
        // Leave a partial frame buffered on the first connection.
        let first = registry.get_mut(id).unwrap();
        first.stream_mut().push_read(&frames(&[b"leftover"])[..6]);
        first.handle_io();
        registry.remove(id);

        let reused = registry.insert(conn()).ok().unwrap();
        assert_eq!(reused, id);

        let second = registry.get_mut(reused).unwrap();
        second.stream_mut().push_read(&frames(&[b"fresh"]));
        second.handle_io();
        assert_eq!(second.stream_mut().written, frames(&[b"fresh"]));
    }
}
