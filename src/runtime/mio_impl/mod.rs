//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;
mod listener;

use crate::config::Config;

pub use event_loop::Server;

/// Bind and run the server using the mio backend.
pub fn run(config: &Config) -> std::io::Result<()> {
    Server::bind(config)?.run()
}
