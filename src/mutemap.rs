//! Per-worker mute map: overloaded receiver → senders muted on its behalf.
//!
//! When an actor sends to an overloaded receiver, the worker executing the
//! sender records the (receiver, sender) relation here and stops
//! scheduling the sender. The map is strictly private to its owning
//! worker: a sender only ever occupies a single worker's mute map (it is
//! muted by the worker that was running it, and a muted actor is not
//! enqueued anywhere), so no locking is needed. Receivers, by contrast,
//! may appear as a key in several workers' maps at once.

use std::collections::{HashMap, HashSet};

use crate::actor::Actor;

/// Hashable actor identity: the actor's address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ActorKey(*mut Actor);

// SAFETY: `ActorKey` is only the address; the map never dereferences it.
// The owning worker moves with its mute map between threads only at
// start/shutdown, when no other thread touches it.
unsafe impl Send for ActorKey {}

/// receiver → set of muted senders, owned by one worker.
#[derive(Debug, Default)]
pub struct MuteMap {
    map: HashMap<ActorKey, HashSet<ActorKey>>,
}

impl MuteMap {
    /// Creates an empty mute map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no receiver has muted senders on this worker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of receivers with muted senders on this worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Records `sender` as muted on behalf of `recv`.
    ///
    /// Returns `true` if the relation is new — the caller bumps the
    /// sender's mute count exactly once per distinct relation.
    pub fn insert(&mut self, recv: *mut Actor, sender: *mut Actor) -> bool {
        self.map
            .entry(ActorKey(recv))
            .or_default()
            .insert(ActorKey(sender))
    }

    /// Removes `recv`'s entry, returning its senders in no particular
    /// order. Returns `None` if `recv` has no muted senders on this
    /// worker.
    pub fn remove(&mut self, recv: *mut Actor) -> Option<Vec<*mut Actor>> {
        self.map
            .remove(&ActorKey(recv))
            .map(|set| set.into_iter().map(|k| k.0).collect())
    }

    /// Returns `true` if `sender` is recorded as muted for `recv`.
    #[must_use]
    pub fn contains(&self, recv: *mut Actor, sender: *mut Actor) -> bool {
        self.map
            .get(&ActorKey(recv))
            .is_some_and(|set| set.contains(&ActorKey(sender)))
    }
}
