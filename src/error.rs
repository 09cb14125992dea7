//! Error types for server startup and the event loop.
//!
//! Only failures that end the process are represented here. Errors scoped to a
//! single client connection stay as `io::Error` inside the dispatcher and
//! close that connection.

use std::io;
use std::net::SocketAddr;

/// Fatal server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Creating or configuring the listening socket failed.
    #[error("failed to create listening socket: {0}")]
    Socket(#[source] io::Error),

    /// Binding the listening socket failed (address in use, not local, ...).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Switching the bound socket into listening mode failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Bound address.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Creating the readiness multiplexer or the wake pipe failed.
    #[error("failed to create multiplexer: {0}")]
    Multiplexer(#[source] io::Error),

    /// Registering the listener or the wake pipe failed.
    #[error("failed to register with multiplexer: {0}")]
    Register(#[source] io::Error),

    /// The blocking wait call failed for a reason other than a signal.
    #[error("wait for readiness failed: {0}")]
    Wait(#[source] io::Error),

    /// Accepting a connection failed with a non-recoverable error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Installing the termination signal handlers failed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_bind_error_carries_source() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:80"));
        let source = err.source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_wait_error_message() {
        let err = ServerError::Wait(io::Error::from_raw_os_error(libc::EBADF));
        assert!(err.to_string().starts_with("wait for readiness failed"));
    }
}
