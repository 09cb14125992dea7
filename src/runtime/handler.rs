//! Per-connection request handling.
//!
//! A readable connection gets exactly one read. Whatever that read returns is
//! the request: it is transformed and written back before the handler
//! returns, unless the socket pushes back, in which case the unsent tail is
//! parked on the connection until it becomes writable.

use crate::runtime::connection::{ConnState, Connection};
use crate::runtime::protocol::Transform;
use crate::runtime::socket::{read_once, write_pending, ReadOutcome, WriteProgress};
use bytes::BytesMut;
use std::io;
use std::time::Instant;
use tracing::debug;

/// What the dispatcher should do with the connection after a handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The response was written in full.
    Responded {
        /// The read filled the whole buffer, so more input may be waiting.
        more_input: bool,
    },
    /// Part of the response is still queued; wait for write readiness.
    Blocked,
    /// The peer closed without sending anything; tear the connection down.
    Closed,
    /// Spurious wakeup, nothing to do.
    Idle,
}

/// Service one read readiness event.
pub fn on_readable<T: Transform>(
    conn_id: usize,
    conn: &mut Connection,
    scratch: &mut [u8],
    transform: &T,
    log_payloads: bool,
) -> io::Result<Outcome> {
    if matches!(conn.state, ConnState::Writing(_)) {
        // Finish the previous response before reading a new request.
        return Ok(Outcome::Idle);
    }

    let n = match read_once(&mut conn.stream, scratch)? {
        ReadOutcome::Data(n) => n,
        ReadOutcome::Closed => return Ok(Outcome::Closed),
        ReadOutcome::WouldBlock => return Ok(Outcome::Idle),
    };
    conn.touch(Instant::now());

    let input = &scratch[..n];
    let mut response = BytesMut::with_capacity(n);
    transform.apply(input, &mut response);

    if log_payloads {
        debug!(
            conn_id,
            input = %String::from_utf8_lossy(input),
            output = %String::from_utf8_lossy(&response),
            "Request payload"
        );
    }
    debug!(conn_id, bytes = n, "Request read");

    let more_input = n == scratch.len();
    match write_pending(&mut conn.stream, &mut response)? {
        WriteProgress::Complete => Ok(Outcome::Responded { more_input }),
        WriteProgress::Blocked => {
            debug!(conn_id, remaining = response.len(), "Response blocked");
            conn.state = ConnState::Writing(response);
            Ok(Outcome::Blocked)
        }
    }
}

/// Resume a parked response on write readiness.
pub fn on_writable(conn_id: usize, conn: &mut Connection) -> io::Result<Outcome> {
    let pending = match conn.state {
        ConnState::Writing(ref mut pending) => pending,
        ConnState::Reading => return Ok(Outcome::Idle),
    };

    let progress = write_pending(&mut conn.stream, pending)?;
    conn.touch(Instant::now());

    match progress {
        WriteProgress::Complete => {
            debug!(conn_id, "Blocked response drained");
            conn.state = ConnState::Reading;
            Ok(Outcome::Responded { more_input: false })
        }
        WriteProgress::Blocked => Ok(Outcome::Blocked),
    }
}
