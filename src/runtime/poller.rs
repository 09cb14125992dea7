//! Readiness multiplexer.
//!
//! Wraps `mio::Poll` (epoll on Linux, kqueue on macOS). `wait` copies the
//! ready set out of mio's event buffer so the caller can register and
//! deregister sources while it dispatches.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// One descriptor that became ready during a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    /// Data, an orderly close, or a socket error is waiting for a read.
    pub readable: bool,
    pub writable: bool,
    /// The peer has shut down its sending side. Under edge triggering this is
    /// reported once, even if a read for earlier data is still to come.
    pub read_closed: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// Create a multiplexer that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    /// Replace the interest set of an already registered source.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Block until a registered source is ready or `timeout` elapses.
    ///
    /// `ready` is cleared and refilled. A wait cut short by a signal is not an
    /// error: it returns with an empty ready set.
    pub fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            // Fold hang-up and error into readable so the single read surfaces them.
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
        }));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;

    const LISTENER: Token = Token(0);
    const CLIENT: Token = Token(1);

    #[test]
    fn test_wait_times_out_with_nothing_ready() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut ready = vec![Readiness {
            token: Token(9),
            readable: true,
            writable: false,
            read_closed: false,
        }];
        mux.wait(Some(Duration::from_millis(10)), &mut ready).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_listener_and_stream_readiness() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        mux.register(&mut listener, LISTENER, Interest::READABLE)
            .unwrap();

        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut ready = Vec::new();
        mux.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == LISTENER && r.readable));

        let (mut stream, _) = listener.accept().unwrap();
        mux.register(&mut stream, CLIENT, Interest::READABLE).unwrap();

        client.write_all(b"ping").unwrap();
        mux.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == CLIENT && r.readable && !r.writable));

        mux.reregister(&mut stream, CLIENT, Interest::WRITABLE).unwrap();
        mux.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == CLIENT && r.writable));

        mux.deregister(&mut stream).unwrap();
    }

    #[test]
    fn test_peer_close_reports_readable() {
        let mut mux = Multiplexer::new(8).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut stream = TcpStream::from_std(accepted);
        mux.register(&mut stream, CLIENT, Interest::READABLE).unwrap();

        drop(client);

        let mut ready = Vec::new();
        mux.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == CLIENT && r.readable && r.read_closed));
    }

    #[test]
    fn test_data_then_half_close_reported_together() {
        let mut mux = Multiplexer::new(8).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut stream = TcpStream::from_std(accepted);

        client.write_all(b"abc").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        mux.register(&mut stream, CLIENT, Interest::READABLE).unwrap();

        let mut ready = Vec::new();
        mux.wait(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == CLIENT && r.readable && r.read_closed));
    }
}
