//! Actor surface and execution-engine seam.
//!
//! The scheduler does not execute actor behavior itself; it hands actors
//! to an [`ActorEngine`] in batches and reacts to the engine's reschedule
//! decision. [`Actor`] carries only the attributes the scheduler core
//! touches: the muted-relation counter used by the back-pressure
//! bookkeeping, and a flag word read to skip rescheduling actors that
//! have been removed from the live set. Everything else an actor owns
//! (mailbox, state, behavior) lives on the engine's side of the seam.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::scheduler::SchedCtx;

/// The actor was taken out of the live set and must not be rescheduled.
pub const FLAG_UNSCHEDULED: u32 = 1 << 0;

/// The unit of concurrent execution, as seen by the scheduler.
///
/// The engine owns the allocation; the scheduler traffics in `*mut Actor`
/// and never frees one. All shared fields are atomics so workers can read
/// them while the owning worker writes.
pub struct Actor {
    /// Unique actor ID, assigned by the engine.
    pub id: u64,

    /// Number of distinct (sender, receiver) muting relations currently
    /// referencing this actor as the sender.
    ///
    /// Writes are effectively single-writer: a muted sender occupies
    /// exactly one worker's mute map, and only that worker mutates the
    /// counter. Relaxed ordering suffices; the atomic guards reads from
    /// other workers.
    pub muted: AtomicU64,

    flags: AtomicU32,
}

// SAFETY: All shared fields are atomics; the `id` is immutable after
// construction. Exclusive access during execution is enforced by the
// scheduler (an actor is resident in at most one queue and is never run
// concurrently).
unsafe impl Send for Actor {}
// SAFETY: Concurrent reads/writes of shared fields go through atomics.
unsafe impl Sync for Actor {}

impl Actor {
    /// Creates an actor surface with no flags set and a zero mute count.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            muted: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        }
    }

    /// Returns `true` if all bits of `flag` are set.
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag == flag
    }

    /// Sets the bits of `flag`.
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    /// Clears the bits of `flag`.
    pub fn unset_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    /// Returns `true` if the actor has been removed from the live set.
    #[must_use]
    pub fn is_unscheduled(&self) -> bool {
        self.has_flag(FLAG_UNSCHEDULED)
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}

/// The external actor execution engine.
///
/// The scheduler calls [`run_actor`](ActorEngine::run_actor) with the
/// worker's context, so engine code can call back into
/// [`schedule`](crate::scheduler::schedule),
/// [`mute`](crate::scheduler::mute), and
/// [`unmute_senders`](crate::scheduler::unmute_senders) for the actor it
/// is running.
pub trait ActorEngine: Send + Sync {
    /// Runs up to `batch` messages for `actor` on the calling worker.
    ///
    /// Returns `true` if the actor still has work and should be
    /// rescheduled. `actor` is valid for the duration of the call and is
    /// not concurrently executed anywhere else.
    fn run_actor(&self, ctx: &mut SchedCtx, actor: *mut Actor, batch: u32) -> bool;

    /// Clears the engine-side muted state of a sender whose mute count
    /// dropped to zero. Called before the sender is rescheduled.
    fn unmute_actor(&self, actor: *mut Actor);
}
