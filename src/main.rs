//! frame-echo: a single-threaded frame server
//!
//! Serves many concurrent clients from one thread using readiness-based
//! I/O multiplexing. Clients speak a length-prefixed frame protocol; every
//! request frame is answered with a response frame echoing its payload.
//!
//! Features:
//! - Non-blocking sockets polled with mio (epoll/kqueue)
//! - Pipelined requests answered in order
//! - Fixed per-connection memory with natural backpressure
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use protocols::frame::MAX_MSG;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        max_connections = config.max_connections,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        max_msg = MAX_MSG,
        "Starting frame-echo server"
    );

    // Listener setup and poll failures are fatal.
    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }
    Ok(())
}
