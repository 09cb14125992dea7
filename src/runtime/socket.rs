//! Non-blocking socket primitives.
//!
//! Thin wrappers over `socket2`/`mio` sockets that give the event loop the
//! exact read/write semantics it relies on: one bounded read per call, and
//! writes that make as much progress as the kernel allows without blocking.

use crate::error::{ServerError, ServerResult};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// Pending connections the kernel queues before we accept them.
pub const LISTEN_BACKLOG: i32 = 128;

/// Upper bound on a single read. One read is one request.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Result of a single read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes landed at the front of the buffer.
    Data(usize),
    /// The peer performed an orderly close (read returned zero).
    Closed,
    /// Nothing to read right now.
    WouldBlock,
}

/// Progress of draining a pending response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Every byte has been handed to the kernel.
    Complete,
    /// The socket buffer is full; the remainder is still in the buffer.
    Blocked,
}

/// Create a non-blocking TCP listener bound to `addr`.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> ServerResult<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| ServerError::Listen { addr, source })?;

    Ok(socket.into())
}

/// Perform exactly one read into `buf`.
///
/// `EINTR` is retried since it carries no information about the socket.
pub fn read_once<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write as much of `pending` as the socket accepts, consuming what was sent.
///
/// A short write is followed by another attempt; only a would-block result
/// stops the loop early.
pub fn write_pending<W: Write>(writer: &mut W, pending: &mut BytesMut) -> io::Result<WriteProgress> {
    while pending.has_remaining() {
        match writer.write(pending.chunk()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => pending.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteProgress::Blocked)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(WriteProgress::Complete)
}

/// Shut down both directions of a client socket.
///
/// A peer that already went away yields `NotConnected`, which is not worth
/// reporting.
pub fn terminate(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Accept errors that leave the listener usable.
///
/// Descriptor or memory exhaustion clears up once connections close, and a
/// connection aborted before we accepted it only affects that client.
pub fn is_recoverable_accept_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::ConnectionAborted {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
