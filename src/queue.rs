//! Run-queue primitives for actor scheduling.
//!
//! Wraps [`crossbeam_deque`] to provide the two queue shapes the scheduler
//! needs:
//!
//! - [`RunQueue`] — per-worker FIFO ready queue (owner pushes and pops).
//! - [`RunStealer`] — handle for other workers to pop from a peer's queue.
//! - [`InjectQueue`] — process-wide queue for actors scheduled by
//!   non-worker threads.
//!
//! All queues store `*mut Actor` because the scheduler traffics in raw
//! actor pointers owned by the execution engine. Local queues are FIFO so
//! that a rescheduled actor goes to the back of the line behind any actor
//! that was already waiting.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use crate::actor::Actor;

/// Per-worker ready queue.
///
/// The owning thread pushes to the back and pops from the front (FIFO).
/// Other threads pop from the front via [`RunStealer`].
#[derive(Debug)]
pub struct RunQueue {
    worker: Worker<*mut Actor>,
}

/// Handle for popping from another worker's [`RunQueue`].
///
/// Cloneable — one handle per potential thief.
#[derive(Debug, Clone)]
pub struct RunStealer {
    stealer: Stealer<*mut Actor>,
}

/// Global inject queue shared across all threads.
///
/// Actors scheduled from outside any worker context land here and are
/// drained by workers ahead of their local queues.
#[derive(Debug)]
pub struct InjectQueue {
    injector: Injector<*mut Actor>,
}

// SAFETY: The raw pointers stored in the queues are opaque handles managed
// by the scheduler. crossbeam-deque itself is `Send + Sync`; we only add a
// thin wrapper. The scheduler is responsible for pointer validity.
unsafe impl Send for RunQueue {}
// SAFETY: `RunStealer` wraps `crossbeam_deque::Stealer` which is already
// `Send + Sync`. The `*mut Actor` values are opaque scheduler-managed
// handles.
unsafe impl Send for RunStealer {}
// SAFETY: `Stealer::steal` is safe to call from multiple threads
// concurrently.
unsafe impl Sync for RunStealer {}
// SAFETY: `Injector` is already `Send + Sync`; the `*mut Actor` payloads
// are scheduler-managed.
unsafe impl Send for InjectQueue {}
// SAFETY: `Injector::push` and `Injector::steal` are safe for concurrent
// use.
unsafe impl Sync for InjectQueue {}

impl RunQueue {
    /// Creates a new run queue and its corresponding stealer handle.
    ///
    /// # Safety
    ///
    /// The caller must ensure that all `*mut Actor` values pushed into the
    /// queue remain valid until they are popped or stolen.
    #[must_use]
    pub unsafe fn new() -> (Self, RunStealer) {
        let worker = Worker::new_fifo();
        let stealer = worker.stealer();
        (Self { worker }, RunStealer { stealer })
    }

    /// Pushes an actor onto the back of the queue (owner thread only).
    pub fn push(&self, actor: *mut Actor) {
        self.worker.push(actor);
    }

    /// Pops the oldest actor from the queue (owner thread).
    ///
    /// Returns `None` if the queue is empty.
    #[must_use]
    pub fn pop(&self) -> Option<*mut Actor> {
        self.worker.pop()
    }

    /// Returns `true` if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }
}

impl RunStealer {
    /// Pops the oldest actor from the associated queue.
    ///
    /// Returns `None` if the queue is empty. Contended steals are retried
    /// internally.
    #[must_use]
    pub fn steal(&self) -> Option<*mut Actor> {
        loop {
            match self.stealer.steal() {
                Steal::Success(actor) => return Some(actor),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Returns `true` if the associated queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stealer.is_empty()
    }
}

impl InjectQueue {
    /// Creates a new empty inject queue.
    ///
    /// # Safety
    ///
    /// The caller must ensure that all `*mut Actor` values pushed into the
    /// queue remain valid until they are consumed.
    #[must_use]
    pub unsafe fn new() -> Self {
        Self {
            injector: Injector::new(),
        }
    }

    /// Pushes an actor into the inject queue (any thread).
    pub fn push(&self, actor: *mut Actor) {
        self.injector.push(actor);
    }

    /// Pops the oldest actor from the inject queue.
    ///
    /// Returns `None` if the queue is empty. Contended steals are retried
    /// internally.
    #[must_use]
    pub fn pop(&self) -> Option<*mut Actor> {
        loop {
            match self.injector.steal() {
                Steal::Success(actor) => return Some(actor),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Returns `true` if the inject queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }
}
