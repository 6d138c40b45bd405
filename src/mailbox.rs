//! Per-worker control-message mailbox.
//!
//! An intrusive Vyukov-style MPSC queue: any thread can push concurrently
//! (lock-free via atomic exchange), while a single consumer — the owning
//! worker — pops. Each worker drains its mailbox at the top of every
//! dispatch iteration and once per steal-loop iteration.
//!
//! The queue uses a stub sentinel node to avoid null-pointer edge cases.
//! When the consumer drains the last real node, the stub is re-injected so
//! the tail always has a successor to advance to.
//!
//! # Memory ordering
//!
//! - **push**: `AcqRel` on exchange (makes node data visible to consumer),
//!   `Release` on linking `prev.next`.
//! - **pop**: `Acquire` on loading `next` (sees producer's writes).

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::actor::Actor;

/// Control messages exchanged between workers.
///
/// BLOCK, UNBLOCK, and ACK are always addressed to the coordinator; CNF,
/// TERMINATE, UNMUTE_ACTOR, and the ASIO notices are broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedMsg {
    /// The sending worker ran out of work and is not holding muted senders.
    Block,
    /// The sending worker found work again; cancels any in-flight ACK round.
    Unblock,
    /// Confirmation request for the quiescence round with this token.
    Cnf(u32),
    /// Confirmation reply, echoing the round token.
    Ack(u32),
    /// One-shot exit order.
    Terminate,
    /// Run unmute processing for this receiver on the destination worker.
    UnmuteActor(*mut Actor),
    /// External event sources are registered; termination is inhibited.
    NoisyAsio,
    /// No external event sources remain.
    UnnoisyAsio,
}

/// Mailbox node. The stub sentinel carries no message.
struct MsgNode {
    next: AtomicPtr<MsgNode>,
    msg: Option<SchedMsg>,
}

/// Vyukov-style lock-free MPSC mailbox of [`SchedMsg`].
///
/// Any thread may [`push`](SchedMailbox::push). Only the owning worker may
/// [`pop`](SchedMailbox::pop).
pub struct SchedMailbox {
    /// Producers push here via atomic exchange.
    head: AtomicPtr<MsgNode>,
    /// Consumer pops from here. Only accessed by the consumer thread.
    tail: UnsafeCell<*mut MsgNode>,
    /// Heap-allocated sentinel node. Must be on the heap so that pointers
    /// to it remain stable when the mailbox itself is moved.
    stub: *mut MsgNode,
}

// SAFETY: The mailbox owns its heap-allocated nodes; moving it between
// threads moves only pointers to stable allocations.
unsafe impl Send for SchedMailbox {}
// SAFETY: `push` only touches the atomic `head` (plus the pushed node's
// `next`), so concurrent producers are safe. `pop` carries a single-consumer
// contract enforced by its `unsafe` signature.
unsafe impl Sync for SchedMailbox {}

impl std::fmt::Debug for SchedMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedMailbox")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("stub", &self.stub)
            .finish_non_exhaustive()
    }
}

impl SchedMailbox {
    /// Creates a new empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        let stub = Box::into_raw(Box::new(MsgNode {
            next: AtomicPtr::new(ptr::null_mut()),
            msg: None,
        }));
        Self {
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
            stub,
        }
    }

    /// Pushes a control message. Lock-free; may be called from any thread.
    pub fn push(&self, msg: SchedMsg) {
        let node = Box::into_raw(Box::new(MsgNode {
            next: AtomicPtr::new(ptr::null_mut()),
            msg: Some(msg),
        }));
        // SAFETY: `node` was just allocated and is exclusively ours until
        // linked into the queue.
        unsafe { self.push_node(node) };
    }

    /// Links a node into the queue.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid `MsgNode` not currently in the queue.
    unsafe fn push_node(&self, node: *mut MsgNode) {
        // SAFETY: Caller guarantees `node` is valid.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }

        // Atomically swap head to our node. AcqRel ensures:
        //  - Release: node data visible to consumer
        //  - Acquire: we see the previous head for linking
        let prev = self.head.swap(node, Ordering::AcqRel);

        // Link previous head to this node. Release pairs with the
        // consumer's Acquire load of `next`.
        // SAFETY: `prev` was either the stub or a previously pushed node.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Pops the oldest pending message.
    ///
    /// Returns `None` when the mailbox is empty, and also when a push is
    /// in flight (producer has exchanged head but not yet linked
    /// `prev.next`) — the worker retries on its next drain, so the
    /// distinction does not matter to callers.
    ///
    /// # Safety
    ///
    /// Must only be called from the mailbox's single consumer: the owning
    /// worker thread, or any one thread after all workers have been joined.
    pub unsafe fn pop(&self) -> Option<SchedMsg> {
        let tail_slot = self.tail.get();
        // SAFETY: single consumer per the caller contract.
        let mut tail = unsafe { *tail_slot };
        // SAFETY: `tail` is always a valid pointer (stub or a pushed node).
        let mut next = unsafe { (*tail).next.load(Ordering::Acquire) };

        // Skip past the stub sentinel.
        if tail == self.stub {
            if next.is_null() {
                return None;
            }
            // SAFETY: single consumer; `next` is a valid pushed node.
            unsafe { *tail_slot = next };
            tail = next;
            // SAFETY: `tail` is now a valid real node.
            next = unsafe { (*tail).next.load(Ordering::Acquire) };
        }

        if !next.is_null() {
            // Common case: tail has a successor; consume tail.
            // SAFETY: single consumer; `next` remains linked.
            unsafe { *tail_slot = next };
            // SAFETY: `tail` is a real node, now fully detached.
            return Some(unsafe { Self::consume(tail) });
        }

        let head = self.head.load(Ordering::Acquire);
        if tail != head {
            // A producer has exchanged head but hasn't linked prev.next.
            return None;
        }

        // tail == head: last real node. Re-inject the stub as sentinel.
        // SAFETY: the stub is heap-allocated, always valid, and not
        // currently in the queue (the consumer advanced past it above).
        unsafe { self.push_node(self.stub) };

        // SAFETY: `tail` is still valid (same pointer checked above).
        next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if !next.is_null() {
            // SAFETY: single consumer.
            unsafe { *tail_slot = next };
            // SAFETY: `tail` is a real node, now fully detached.
            return Some(unsafe { Self::consume(tail) });
        }

        // The stub's link isn't visible yet; retry on the next drain.
        None
    }

    /// Frees a detached node and returns its message.
    ///
    /// # Safety
    ///
    /// `node` must be a real (non-stub) node that has been unlinked from
    /// the queue and is exclusively owned by the caller.
    unsafe fn consume(node: *mut MsgNode) -> SchedMsg {
        // SAFETY: caller guarantees exclusive ownership of a Box-allocated
        // node.
        let mut node = unsafe { Box::from_raw(node) };
        node.msg.take().expect("stub node is never consumed")
    }
}

impl Default for SchedMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SchedMailbox {
    fn drop(&mut self) {
        // All producers are gone once the mailbox is dropped, so the chain
        // is fully linked and can be walked without synchronization. The
        // stub may sit anywhere in the chain; it is freed exactly once at
        // the end.
        let mut node = *self.tail.get_mut();
        while !node.is_null() {
            // SAFETY: every chain node is either the stub or a pushed
            // Box-allocated node; nothing else references them now.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            if node != self.stub {
                // SAFETY: real nodes were allocated with Box::into_raw in
                // `push` and are owned solely by the chain.
                drop(unsafe { Box::from_raw(node) });
            }
            node = next;
        }
        // SAFETY: the stub was allocated with Box::into_raw in `new`.
        drop(unsafe { Box::from_raw(self.stub) });
    }
}
