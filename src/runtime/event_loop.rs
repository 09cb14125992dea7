//! mio event loop implementation.
//!
//! Readiness-based model: the multiplexer tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! Everything runs on one thread. Each readable connection is handled to
//! completion inside the iteration that reported it; the only place the
//! thread blocks is the multiplexer wait.
//!
//! mio registrations are edge-triggered. A connection whose single read
//! filled the whole buffer is queued for another pass on the next iteration,
//! and that iteration does not block, so input larger than one read is still
//! served one read at a time. The same applies to a connection whose peer
//! half-closed in the same edge as its last request: the EOF behind the data
//! is only seen by another read.

use crate::config::{Config, ConnectionPolicy};
use crate::error::{ServerError, ServerResult};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::handler::{self, Outcome};
use crate::runtime::poller::{Multiplexer, Readiness};
use crate::runtime::protocol::Transform;
use crate::runtime::shutdown::{drain_wake_pipe, ShutdownHandle};
use crate::runtime::socket::{self, LISTEN_BACKLOG, READ_CHUNK_SIZE};
use mio::net::TcpListener;
use mio::unix::pipe;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Delay before retrying an accept that failed on resource exhaustion.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Single-threaded server loop, generic over the request transform.
pub struct EventLoop<T> {
    mux: Multiplexer,
    listener: TcpListener,
    wake: pipe::Receiver,
    shutdown: ShutdownHandle,
    connections: ConnectionRegistry,
    transform: T,
    policy: ConnectionPolicy,
    idle_timeout: Option<Duration>,
    log_payloads: bool,
    /// Request buffer reused by every handler invocation.
    scratch: Box<[u8]>,
    ready: Vec<Readiness>,
    /// Connections with input left behind their last read, and whether the
    /// peer has already half-closed.
    carry_over: Vec<(usize, bool)>,
    retry_accept: bool,
    last_sweep: Instant,
}

impl<T: Transform> EventLoop<T> {
    /// Bind the listener and set up the multiplexer.
    ///
    /// `wake` is the receiver created alongside `shutdown`; it is registered
    /// so a shutdown request can interrupt the wait.
    pub fn bind(
        config: &Config,
        transform: T,
        shutdown: ShutdownHandle,
        mut wake: pipe::Receiver,
    ) -> ServerResult<Self> {
        let addr = SocketAddr::from((config.host, config.port));

        let listener = socket::create_listener(addr, LISTEN_BACKLOG)?;
        let mut listener = TcpListener::from_std(listener);

        let mux = Multiplexer::new(LISTEN_BACKLOG as usize).map_err(ServerError::Multiplexer)?;
        mux.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;

        mux.register(&mut wake, WAKE_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;

        Ok(Self {
            mux,
            listener,
            wake,
            shutdown,
            connections: ConnectionRegistry::new(config.max_connections),
            transform,
            policy: config.policy,
            idle_timeout: config.idle_timeout,
            log_payloads: config.log_payloads,
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            ready: Vec::with_capacity(LISTEN_BACKLOG as usize),
            carry_over: Vec::new(),
            retry_accept: false,
            last_sweep: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown is requested.
    ///
    /// The listener, the multiplexer and every open connection are released
    /// when this returns.
    pub fn run(mut self) -> ServerResult<()> {
        info!(
            addr = %self.local_addr().map_err(ServerError::Socket)?,
            policy = ?self.policy,
            idle_timeout = ?self.idle_timeout,
            "Listening"
        );

        loop {
            if !self.shutdown.enter_wait() {
                break;
            }
            let timeout = self.wait_timeout();
            let waited = self.mux.wait(timeout, &mut self.ready);
            self.shutdown.leave_wait();
            waited.map_err(ServerError::Wait)?;

            if std::mem::take(&mut self.retry_accept) {
                self.accept_connections()?;
            }

            for (conn_id, read_closed) in std::mem::take(&mut self.carry_over) {
                self.service(conn_id, true, false, read_closed);
            }

            let ready = std::mem::take(&mut self.ready);
            for readiness in &ready {
                self.dispatch(*readiness)?;
            }
            self.ready = ready;

            self.sweep_idle(Instant::now());

            if self.shutdown.is_requested() {
                break;
            }
        }

        self.teardown();
        Ok(())
    }

    /// Pick the wait timeout for the next iteration.
    fn wait_timeout(&self) -> Option<Duration> {
        if !self.carry_over.is_empty() {
            return Some(Duration::ZERO);
        }
        let sweep = self.idle_timeout.map(sweep_interval);
        if self.retry_accept {
            return Some(sweep.map_or(ACCEPT_RETRY_DELAY, |s| s.min(ACCEPT_RETRY_DELAY)));
        }
        sweep
    }

    fn dispatch(&mut self, readiness: Readiness) -> ServerResult<()> {
        match readiness.token {
            LISTENER_TOKEN => self.accept_connections(),
            WAKE_TOKEN => {
                if let Err(e) = drain_wake_pipe(&mut self.wake) {
                    warn!(error = %e, "Failed to drain wake pipe");
                }
                Ok(())
            }
            Token(conn_id) => {
                self.service(
                    conn_id,
                    readiness.readable,
                    readiness.writable,
                    readiness.read_closed,
                );
                Ok(())
            }
        }
    }

    /// Accept until the backlog is empty.
    fn accept_connections(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                // mio accepts with SOCK_NONBLOCK, so the stream is already non-blocking.
                Ok((stream, peer)) => {
                    let conn_id = match self.connections.insert(Connection::new(stream, peer)) {
                        Ok(id) => id,
                        Err(rejected) => {
                            warn!(peer = %peer, "Connection limit reached, rejecting");
                            if let Err(e) = socket::terminate(&rejected.stream) {
                                debug!(peer = %peer, error = %e, "Shutdown failed");
                            }
                            continue;
                        }
                    };

                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => {
                            self.mux
                                .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                        }
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if socket::is_recoverable_accept_error(&e) => {
                    warn!(error = %e, open = self.connections.len(), "Accept failed, retrying later");
                    self.retry_accept = true;
                    break;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
        Ok(())
    }

    /// Run the connection handler for whatever the connection is ready for.
    ///
    /// `read_closed` is the peer's half-close as reported with this readiness.
    fn service(&mut self, conn_id: usize, readable: bool, writable: bool, read_closed: bool) {
        if writable {
            let result = match self.connections.get_mut(conn_id) {
                Some(conn) => handler::on_writable(conn_id, conn),
                None => return,
            };
            self.settle(conn_id, result, true, false);
        }

        if readable {
            let result = match self.connections.get_mut(conn_id) {
                Some(conn) => handler::on_readable(
                    conn_id,
                    conn,
                    &mut self.scratch,
                    &self.transform,
                    self.log_payloads,
                ),
                None => return,
            };
            self.settle(conn_id, result, false, read_closed);
        }
    }

    /// Apply the connection policy to a handler outcome.
    ///
    /// I/O errors are confined to the connection that raised them.
    fn settle(
        &mut self,
        conn_id: usize,
        result: io::Result<Outcome>,
        after_write: bool,
        read_closed: bool,
    ) {
        match result {
            Ok(Outcome::Idle) => {}
            Ok(Outcome::Closed) => self.close_connection(conn_id, "peer closed"),
            Ok(Outcome::Blocked) => {
                if !after_write {
                    self.set_interest(conn_id, Interest::WRITABLE);
                }
            }
            Ok(Outcome::Responded { more_input }) => match self.policy {
                ConnectionPolicy::Close => self.close_connection(conn_id, "response sent"),
                ConnectionPolicy::KeepAlive => {
                    if after_write {
                        self.set_interest(conn_id, Interest::READABLE);
                    } else if more_input || read_closed {
                        // The edge is spent; read again next pass for the
                        // rest of the input or the EOF behind it.
                        self.carry_over.push((conn_id, read_closed));
                    }
                }
            },
            Err(e) => {
                warn!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id, "I/O error");
            }
        }
    }

    fn set_interest(&mut self, conn_id: usize, interest: Interest) {
        let result = match self.connections.get_mut(conn_id) {
            Some(conn) => self
                .mux
                .reregister(&mut conn.stream, Token(conn_id), interest),
            None => return,
        };
        if let Err(e) = result {
            warn!(conn_id, error = %e, "Failed to update interest");
            self.close_connection(conn_id, "reregister failed");
        }
    }

    fn close_connection(&mut self, conn_id: usize, reason: &'static str) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            if let Err(e) = socket::terminate(&conn.stream) {
                debug!(conn_id, error = %e, "Shutdown failed");
            }
            let _ = self.mux.deregister(&mut conn.stream);
            debug!(conn_id, peer = %conn.peer, reason, "Connection closed");
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        if now.saturating_duration_since(self.last_sweep) < sweep_interval(timeout) {
            return;
        }
        self.last_sweep = now;

        for conn_id in self.connections.idle(now, timeout) {
            self.close_connection(conn_id, "idle timeout");
        }
    }

    /// Drop every connection still open. In-flight work is abandoned.
    fn teardown(&mut self) {
        let open = self.connections.len();
        for mut conn in self.connections.drain() {
            let _ = self.mux.deregister(&mut conn.stream);
        }
        info!(dropped_connections = open, "Shutting down");
    }
}

/// How often idle connections are checked for a given timeout.
fn sweep_interval(timeout: Duration) -> Duration {
    (timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(1))
}
