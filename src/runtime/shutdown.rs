//! Shutdown coordination between signal delivery and the event loop.
//!
//! Two flags carry the protocol. The signal path is the only writer of
//! `requested` and the only reader of `waiting`; the event loop is the only
//! writer of `waiting` and the only reader of `requested`.
//!
//! When a signal arrives while the loop is blocked in the multiplexer, the
//! signal path writes one byte into a non-blocking pipe whose read end is
//! registered with the multiplexer. The wait returns immediately, the loop
//! sees `requested`, and tears everything down outside signal context. When
//! the signal arrives mid-dispatch the flag alone suffices: the loop checks it
//! before it blocks again.

use mio::unix::pipe;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// State shared between the event loop and the signal handler.
#[derive(Debug)]
struct ShutdownState {
    requested: AtomicBool,
    waiting: AtomicBool,
    /// Write end of the wake pipe.
    wake_fd: OwnedFd,
}

impl ShutdownState {
    /// Only async-signal-safe operations: atomics and `write(2)`.
    fn notify(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) {
            wake(self.wake_fd.as_raw_fd());
        }
    }
}

fn wake(fd: RawFd) {
    let byte = 1u8;
    // A full pipe already guarantees a pending wakeup, so the result is irrelevant.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
}

/// Target of the process-wide termination handlers.
static SIGNAL_TARGET: OnceLock<Arc<ShutdownState>> = OnceLock::new();

extern "C" fn on_terminate(_signum: libc::c_int) {
    if let Some(state) = SIGNAL_TARGET.get() {
        state.notify();
    }
}

/// Cloneable handle used to request shutdown and to install signal handlers.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    /// Create a handle and the wake pipe receiver the event loop must register.
    pub fn new() -> io::Result<(Self, pipe::Receiver)> {
        let (sender, receiver) = pipe::new()?;
        // SAFETY: `into_raw_fd` transfers ownership of a valid descriptor.
        let wake_fd = unsafe { OwnedFd::from_raw_fd(sender.into_raw_fd()) };

        let state = Arc::new(ShutdownState {
            requested: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            wake_fd,
        });

        Ok((Self { state }, receiver))
    }

    /// Route SIGTERM and SIGINT to this handle.
    ///
    /// Only one handle per process can be the signal target; installing a
    /// second one fails with `AlreadyExists`.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        SIGNAL_TARGET
            .set(Arc::clone(&self.state))
            .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "signal target already set"))?;

        for signum in [libc::SIGTERM, libc::SIGINT] {
            // SAFETY: the handler only touches atomics and calls write(2).
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
                // No SA_RESTART: an interrupted wait should return, not resume.
                action.sa_flags = 0;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        Ok(())
    }

    /// Request shutdown from ordinary code. Same effect as a signal.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn trigger(&self) {
        self.state.notify();
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Mark the loop as about to block.
    ///
    /// Returns `false` if shutdown was already requested, in which case the
    /// caller must not block. Sequentially consistent ordering on both sides
    /// means a concurrent signal either sees `waiting` and wakes the pipe, or
    /// is seen here.
    pub(crate) fn enter_wait(&self) -> bool {
        self.state.waiting.store(true, Ordering::SeqCst);
        if self.state.requested.load(Ordering::SeqCst) {
            self.state.waiting.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn leave_wait(&self) {
        self.state.waiting.store(false, Ordering::SeqCst);
    }
}

/// Discard queued wake bytes so the pipe never fills.
pub(crate) fn drain_wake_pipe(receiver: &mut pipe::Receiver) -> io::Result<()> {
    use std::io::Read;

    let mut buf = [0u8; 64];
    loop {
        match receiver.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
