//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A single thread drives every connection. The only blocking point is
//! the bounded wait inside `Poll::poll`; reads and writes never block.

use super::listener::Listener;
use crate::config::Config;
use crate::runtime::{Connection, ConnectionRegistry};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Registered connection plus the interest it is currently polled for.
struct MioConnection {
    conn: Connection<TcpStream>,
    interest: Interest,
    peer: SocketAddr,
}

/// Single-threaded frame server.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionRegistry<MioConnection>,
    poll_timeout: Duration,
    /// Accept queue not yet drained; retried every tick, even without an
    /// event, since the listener won't signal readiness again on its own.
    accept_pending: bool,
}

impl Server {
    /// Bind the listener and register it with a new poller.
    ///
    /// Any failure here is fatal for the server.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::bind_and_listen(config.listen, config.backlog)?;
        poll.registry()
            .register(listener.source_mut(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            poll_timeout: config.poll_timeout,
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop. Only returns if polling fails.
    pub fn run(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Listening");
        loop {
            self.tick()?;
        }
    }

    /// One poll iteration.
    fn tick(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                error!(error = %e, "Poll failed");
                return Err(e);
            }
        }

        let registry = self.poll.registry();

        if self.events.is_empty() {
            let backlogged = self
                .connections
                .iter()
                .filter(|(_, entry)| entry.interest == Interest::WRITABLE)
                .count();
            trace!(
                connections = self.connections.len(),
                backlogged,
                accept_pending = self.accept_pending,
                "Poll timeout"
            );
        }

        // Connections first: an id freed here is not reused until the
        // accepts below, after this batch of events is done.
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_pending = true,
                Token(conn_id) => {
                    handle_connection_event(registry, &mut self.connections, conn_id)
                }
            }
        }

        if self.accept_pending {
            let listener = &self.listener;
            let drained =
                accept_connections(|| listener.accept_one(), registry, &mut self.connections);
            self.accept_pending = !drained;
        }

        Ok(())
    }
}

fn handle_connection_event(
    registry: &Registry,
    connections: &mut ConnectionRegistry<MioConnection>,
    conn_id: usize,
) {
    let keep = match connections.get_mut(conn_id) {
        Some(entry) => {
            entry.conn.handle_io();
            trace!(conn_id, state = ?entry.conn.state(), "Dispatched");
            match sync_interest(registry, entry, conn_id) {
                Ok(keep) => keep,
                Err(e) => {
                    debug!(conn_id, error = %e, "Reregister failed");
                    false
                }
            }
        }
        // Stale event for an already closed connection.
        None => return,
    };

    if !keep {
        close_connection(registry, connections, conn_id);
    }
}

/// Match the poller registration to the connection state.
///
/// Returns false once the connection has ended.
fn sync_interest(
    registry: &Registry,
    entry: &mut MioConnection,
    conn_id: usize,
) -> io::Result<bool> {
    let interest = match entry.conn.interest() {
        Some(interest) => interest,
        None => return Ok(false),
    };

    if interest != entry.interest {
        registry.reregister(entry.conn.stream_mut(), Token(conn_id), interest)?;
        entry.interest = interest;
    }
    Ok(true)
}

/// Drain the accept queue: readiness is edge-triggered.
///
/// Returns true once the queue is empty, false if an accept failed and
/// pending connections may remain.
fn accept_connections(
    mut accept: impl FnMut() -> io::Result<Option<(TcpStream, SocketAddr)>>,
    registry: &Registry,
    connections: &mut ConnectionRegistry<MioConnection>,
) -> bool {
    loop {
        match accept() {
            Ok(Some((stream, peer))) => register_connection(registry, connections, stream, peer),
            Ok(None) => return true,
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                debug!(error = %e, "Peer aborted before accept");
            }
            Err(e) => {
                error!(error = %e, "Accept error, retrying next tick");
                return false;
            }
        }
    }
}

fn register_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry<MioConnection>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let entry = MioConnection {
        conn: Connection::new(stream),
        interest: Interest::READABLE,
        peer,
    };

    let conn_id = match connections.insert(entry) {
        Ok(id) => id,
        Err(_rejected) => {
            warn!(peer = %peer, "Connection limit reached");
            return;
        }
    };

    let registered = match connections.get_mut(conn_id) {
        Some(entry) => {
            registry.register(entry.conn.stream_mut(), Token(conn_id), Interest::READABLE)
        }
        None => return,
    };

    match registered {
        Ok(()) => debug!(conn_id, peer = %peer, "Accepted connection"),
        Err(e) => {
            error!(conn_id, peer = %peer, error = %e, "Failed to register connection");
            connections.remove(conn_id);
        }
    }
}

fn close_connection(
    registry: &Registry,
    connections: &mut ConnectionRegistry<MioConnection>,
    conn_id: usize,
) {
    if let Some(mut entry) = connections.remove(conn_id) {
        let _ = registry.deregister(entry.conn.stream_mut());
        debug!(conn_id, peer = %entry.peer, "Connection closed");
        // Dropping the entry closes the socket.
    }
}
