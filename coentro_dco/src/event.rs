//! Event loop integration.
//!
//! The daemon owns the event loop; this layer only asks it to watch a
//! descriptor under a token. Registrations are handles: dropping one
//! removes the descriptor from the loop, which is how destroying a binding
//! unregisters it without a separate call.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::io::RawFd;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::LoopToken;

/// Live registration; dropping it deregisters.
pub trait Registration {
    fn token(&self) -> LoopToken;
}

/// Registration primitive offered by the daemon's event loop.
pub trait EventLoopRegistrar {
    /// Watch `fd` for read readiness and report it under `token`.
    fn register(&self, fd: Option<RawFd>, token: LoopToken) -> io::Result<Box<dyn Registration>>;
}

/// Event loop adapter for daemons running on Tokio.
///
/// Each registration gets a task parked on `AsyncFd::readable`; readiness
/// is forwarded as the registration token on an unbounded channel that the
/// daemon's main loop consumes and hands back to `DcoContext::on_readiness`.
#[derive(Debug, Clone)]
pub struct TokioEventLoop {
    ready_tx: mpsc::UnboundedSender<LoopToken>,
}

impl TokioEventLoop {
    /// Create the adapter and the receiver readiness tokens arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopToken>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (TokioEventLoop { ready_tx }, ready_rx)
    }
}

struct TokioRegistration {
    token: LoopToken,
    task: JoinHandle<()>,
}

impl Registration for TokioRegistration {
    fn token(&self) -> LoopToken {
        self.token
    }
}

impl Drop for TokioRegistration {
    fn drop(&mut self) {
        debug!(token = %self.token, "Deregistering from Tokio reactor");
        self.task.abort();
    }
}

impl EventLoopRegistrar for TokioEventLoop {
    fn register(&self, fd: Option<RawFd>, token: LoopToken) -> io::Result<Box<dyn Registration>> {
        let fd = fd.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "transport has no descriptor to watch",
            )
        })?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(io::Error::other)?;

        // The reactor watches its own duplicate. An aborted task releases it
        // whenever the runtime next polls, which may be after the transport
        // closed `fd` and the number was handed out again.
        // SAFETY: the transport keeps `fd` open for the duration of this call.
        let watched: OwnedFd = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;

        let _enter = handle.enter();
        let async_fd = AsyncFd::with_interest(watched, tokio::io::Interest::READABLE)?;
        let ready_tx = self.ready_tx.clone();

        let task = handle.spawn(async move {
            loop {
                match async_fd.readable().await {
                    Ok(mut guard) => {
                        // The consumer drains until WouldBlock, so readiness
                        // can be cleared before the token is delivered.
                        guard.clear_ready();
                        if ready_tx.send(token).is_err() {
                            debug!(token = %token, "Readiness receiver gone");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(token = %token, error = %e, "Readiness wait failed");
                        break;
                    }
                }
            }
        });

        debug!(token = %token, fd, "Registered with Tokio reactor");
        Ok(Box::new(TokioRegistration { token, task }))
    }
}
