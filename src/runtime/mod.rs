//! Custom single-threaded runtime for the frame server.
//!
//! - `Connection`: per-connection state machine over non-blocking streams
//! - `ConnectionRegistry`: slab-backed table owning connection lifetime
//! - `mio_impl`: readiness-based event loop (epoll on Linux, kqueue on macOS)

mod buffer;
mod connection;
mod mio_impl;
mod request;

pub(crate) use connection::{Connection, ConnectionRegistry};

use crate::config::Config;

/// Run the server until a process-fatal error occurs.
pub fn run(config: &Config) -> std::io::Result<()> {
    mio_impl::run(config)
}
