//! Single-threaded readiness-based runtime.
//!
//! Layers, leaves first:
//! - `socket`: non-blocking listener creation, single reads, draining writes
//! - `poller`: the readiness multiplexer (mio)
//! - `handler`: one read, transform, write back
//! - `event_loop`: accept/dispatch loop, connection policy, idle sweep
//! - `shutdown`: signal-driven shutdown coordination

mod connection;
mod event_loop;
mod handler;
mod poller;
mod protocol;
mod shutdown;
mod socket;

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use event_loop::EventLoop;
use protocol::UpperCase;
use shutdown::ShutdownHandle;

/// Serve upper-cased responses until SIGTERM or SIGINT.
pub fn run(config: &Config) -> ServerResult<()> {
    // Handlers go in before the listener exists, so a signal that races
    // startup is still a clean shutdown.
    let (shutdown, wake) = ShutdownHandle::new().map_err(ServerError::Multiplexer)?;
    shutdown
        .install_signal_handlers()
        .map_err(ServerError::Signal)?;

    EventLoop::bind(config, UpperCase, shutdown, wake)?.run()
}
