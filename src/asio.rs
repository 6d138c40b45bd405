//! Asynchronous-I/O backend seam.
//!
//! The scheduler does not own timers or sockets; it only needs to know
//! whether the I/O subsystem can be stopped. A backend that still has
//! *noisy* registrants — event sources that may produce a message from
//! the outside world (timers, network) — refuses to stop, which keeps the
//! quiescence protocol from terminating the program.
//!
//! [`NullBackend`] is the reference implementation for programs with no
//! external event sources, and the backend the tests drive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::cpu::CoreId;

/// The external asynchronous-I/O subsystem.
///
/// `start` and `stop` are called from worker threads: `stop` from the
/// quiescence coordinator when every worker has acknowledged being
/// blocked, `start` both at runtime start and when a worker unblocks
/// after a stop.
pub trait AsioBackend: Send + Sync {
    /// One-time initialization with the backend's assigned core, if the
    /// embedder asked for a pinned ASIO thread.
    fn init(&self, cpu: Option<CoreId>);

    /// Starts (or restarts) the backend. Returns `false` on failure.
    fn start(&self) -> bool;

    /// Attempts to stop the backend. Returns `false` if noisy registrants
    /// remain, in which case the backend keeps running.
    fn stop(&self) -> bool;
}

/// Backend for programs with no external event sources.
///
/// Tracks running state and a noisy-registrant count; `stop` succeeds
/// exactly when nothing noisy is registered.
#[derive(Debug, Default)]
pub struct NullBackend {
    running: AtomicBool,
    noisy: AtomicU64,
}

impl NullBackend {
    /// Creates a stopped backend with no noisy registrants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while the backend is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registers a noisy event source. While any are registered, `stop`
    /// fails and termination is inhibited.
    pub fn add_noisy(&self) {
        self.noisy.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregisters a noisy event source.
    pub fn remove_noisy(&self) {
        let prev = self.noisy.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "noisy count underflow");
    }
}

impl AsioBackend for NullBackend {
    fn init(&self, _cpu: Option<CoreId>) {}

    fn start(&self) -> bool {
        self.running.store(true, Ordering::Release);
        true
    }

    fn stop(&self) -> bool {
        if self.noisy.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.running.store(false, Ordering::Release);
        true
    }
}
