//! upcase-server: a single-threaded TCP server
//!
//! Each request is whatever one read (up to 8 KiB) returns; the response is
//! the same bytes with ASCII lowercase letters upper-cased.
//!
//! Features:
//! - Readiness-based event loop (epoll on Linux, kqueue on macOS)
//! - Per-connection error isolation
//! - Keep-alive with idle timeout, or close after each response
//! - Graceful shutdown on SIGTERM/SIGINT with exit status 0
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::Config;
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
        host = %config.host,
        port = config.port,
        policy = ?config.policy,
        max_connections = config.max_connections,
        idle_timeout = ?config.idle_timeout,
        "Starting upcase-server"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
