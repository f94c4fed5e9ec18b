//! Passive socket producing new connections.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Non-blocking listening socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Create a non-blocking listener with `SO_REUSEADDR`, bound to `addr`.
    pub fn bind_and_listen(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(Self {
            inner: TcpListener::from_std(std_listener),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` if nothing is pending. Accepted streams are
    /// already non-blocking.
    pub fn accept_one(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.inner.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Event source for poll registration.
    pub fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}
