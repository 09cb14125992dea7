//! Connection state for accepted clients.
//!
//! Each connection tracks whether it is waiting for a request or draining a
//! response, plus the last time it made progress so idle connections can be
//! swept.

use bytes::BytesMut;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Registered for read readiness, waiting for the next request.
    Reading,
    /// Registered for write readiness; holds the unsent tail of a response.
    Writing(BytesMut),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            last_activity: Instant::now(),
        }
    }

    /// Record that the connection made progress.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }
}

/// Registry of open connections, keyed by the token they are registered under.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Ids of connections with no progress for at least `timeout`.
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_idle(now, timeout))
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove every connection, leaving the registry empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain()
    }
}
