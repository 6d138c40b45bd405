//! Work-stealing scheduler with cooperative quiescence detection.
//!
//! A fixed pool of OS worker threads, each running actors from its own
//! FIFO run queue. Idle workers steal from peers (rotating reverse scan)
//! or from the shared inject queue. Workers exchange control messages
//! through per-worker mailboxes; worker 0 — the [`COORDINATOR`] — collects
//! BLOCK/UNBLOCK announcements and drives a two-phase CNF/ACK protocol
//! that terminates the program once every worker is out of work and the
//! ASIO backend reports no outstanding external event sources.
//!
//! Back-pressure: senders overwhelming a receiver are *muted* — parked in
//! the worker's [`MuteMap`] and kept out of every run queue until the
//! receiver drains, at which point they are rescheduled and the unmute is
//! broadcast so other workers holding the same actor as a receiver key
//! can release their own senders.
//!
//! # Surface
//!
//! - [`Runtime::new`] / [`Runtime::start`] / [`Runtime::stop`] — owned
//!   lifecycle for embedders and tests.
//! - [`init`] / [`start`] / [`stop`] — process-current runtime, plus
//!   [`register_thread`] / [`unregister_thread`] / [`ctx`] for non-worker
//!   threads that need to schedule actors.
//! - [`schedule`], [`mute`], [`unmute_senders`], [`start_global_unmute`],
//!   [`noisy_asio`], [`unnoisy_asio`] — called from engine code with a
//!   worker context.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::actor::{Actor, ActorEngine};
use crate::asio::AsioBackend;
use crate::cpu;
use crate::mailbox::{SchedMailbox, SchedMsg};
use crate::mutemap::MuteMap;
use crate::queue::{InjectQueue, RunQueue, RunStealer};

// ── Constants ───────────────────────────────────────────────────────────

/// Maximum number of messages an actor processes per scheduling slot.
pub const BATCH: u32 = 100;

/// Maximum number of workers the scheduler supports.
pub const MAX_WORKERS: usize = 256;

/// The worker that aggregates BLOCK/UNBLOCK/ACK traffic and arbitrates
/// quiescence. Its mailbox is the serializing point for the protocol.
const COORDINATOR: usize = 0;

/// How long a worker must have been idle, in tick units (nanoseconds),
/// before it announces itself blocked. BLOCK/UNBLOCK pairs are expensive;
/// most steal attempts succeed well inside this window.
const BLOCK_DELAY_NS: u64 = 1_000_000;

// ── External collaborator seams ─────────────────────────────────────────

/// The cycle detector, told to wind down once during shutdown, after all
/// workers have been joined.
pub trait CycleDetector: Send + Sync {
    fn terminate(&self);
}

// ── Configuration ───────────────────────────────────────────────────────

/// Scheduler configuration, consumed at [`Runtime::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Worker thread count; 0 means one per available CPU (overridable
    /// via `FROE_WORKERS`). Clamped to `1..=MAX_WORKERS`.
    pub threads: u32,
    /// Busy-pause instead of yielding to the OS when idle.
    pub noyield: bool,
    /// Disable CPU pinning.
    pub nopin: bool,
    /// Pin the ASIO thread to a dedicated core, if one is spare.
    pub pinasio: bool,
}

/// Resolves the configured thread count, honoring the `FROE_WORKERS`
/// environment override when the embedder left it at 0.
fn worker_count(threads: u32) -> usize {
    let requested = if threads == 0 {
        match std::env::var("FROE_WORKERS") {
            Ok(val) => match val.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    eprintln!("warning: FROE_WORKERS={val} is invalid, using the CPU count");
                    cpu::count() as usize
                }
            },
            Err(_) => cpu::count() as usize,
        }
    } else {
        threads as usize
    };
    requested.clamp(1, MAX_WORKERS)
}

// ── Observability counters ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    actors_scheduled: AtomicU64,
    steals: AtomicU64,
    blocks_sent: AtomicU64,
    unblocks_sent: AtomicU64,
    cnf_rounds: AtomicU64,
    stale_acks: AtomicU64,
    unmutes_broadcast: AtomicU64,
}

/// Consolidated scheduler metrics snapshot.
///
/// Counters are relaxed and advisory; fields are captured at
/// approximately the same instant.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    /// Total worker threads.
    pub worker_count: u64,
    /// Actors pushed onto a run queue since the runtime was created.
    pub actors_scheduled: u64,
    /// Successful steals (peer queues and inject).
    pub steals: u64,
    /// BLOCK announcements sent to the coordinator.
    pub blocks_sent: u64,
    /// UNBLOCK announcements sent to the coordinator.
    pub unblocks_sent: u64,
    /// CNF rounds started.
    pub cnf_rounds: u64,
    /// ACKs dropped for carrying a superseded token.
    pub stale_acks: u64,
    /// UNMUTE_ACTOR broadcasts issued.
    pub unmutes_broadcast: u64,
}

// ── Runtime ─────────────────────────────────────────────────────────────

/// Shared per-worker state: what other threads may touch.
struct SchedShared {
    /// Control mailbox; any thread pushes, only the owner pops.
    mailbox: SchedMailbox,
    /// Handle for stealing from this worker's run queue.
    stealer: RunStealer,
    /// Core this worker pins to, unless pinning is disabled.
    cpu: Option<cpu::CoreId>,
}

/// Worker-private state, owned by the worker thread for its lifetime.
struct WorkerCtx {
    index: usize,
    queue: RunQueue,
    mute_map: MuteMap,
    /// Workers this worker believes are blocked. Consulted only on the
    /// coordinator; kept per-worker because UNBLOCK handling is uniform.
    block_count: usize,
    /// Epoch of the current CNF/ACK round. Bumping it invalidates every
    /// outstanding ACK.
    ack_token: u32,
    ack_count: usize,
    terminate: bool,
    asio_stopped: bool,
    asio_noisy: bool,
    /// Where the rotating victim scan resumes.
    last_victim: usize,
}

impl WorkerCtx {
    fn new(index: usize, queue: RunQueue) -> Self {
        Self {
            index,
            queue,
            mute_map: MuteMap::new(),
            block_count: 0,
            ack_token: 0,
            ack_count: 0,
            terminate: false,
            asio_stopped: false,
            asio_noisy: false,
            last_victim: index,
        }
    }
}

/// Per-thread scheduler context.
///
/// Worker threads own one with worker state attached; threads registered
/// via [`register_thread`] own one without. The engine receives a mutable
/// reference during [`ActorEngine::run_actor`] and uses it for
/// [`schedule`], [`mute`], and [`unmute_senders`] calls.
pub struct SchedCtx {
    rt: Arc<Runtime>,
    worker: Option<WorkerCtx>,
}

impl SchedCtx {
    /// The runtime this context belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }
}

/// The scheduler runtime: worker pool, inject queue, protocol plumbing.
///
/// Constructed once at [`init`] (or directly for embedding and tests) and
/// threaded through every context; there is no hidden global state beyond
/// the optional process-current handle.
pub struct Runtime {
    scheds: Box<[SchedShared]>,
    inject: InjectQueue,
    /// When false (library mode), workers still announce BLOCK but the
    /// coordinator never starts a CNF round.
    detect_quiescence: AtomicBool,
    use_yield: bool,
    nopin: bool,
    engine: Arc<dyn ActorEngine>,
    asio: Arc<dyn AsioBackend>,
    cycle: Option<Box<dyn CycleDetector>>,
    /// Worker state built at construction, handed to threads at start.
    pending: Mutex<Vec<Option<WorkerCtx>>>,
    /// Worker thread handles, taken during shutdown.
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

impl Runtime {
    /// Builds a runtime: queues, mailboxes, and mute maps for every
    /// worker, CPU assignment, and ASIO initialization. No threads run
    /// until [`start`](Runtime::start).
    pub fn new(
        options: Options,
        engine: Arc<dyn ActorEngine>,
        asio: Arc<dyn AsioBackend>,
        cycle: Option<Box<dyn CycleDetector>>,
    ) -> Arc<Self> {
        let count = worker_count(options.threads);
        let assignment = cpu::assign(count, options.nopin, options.pinasio);

        // Every queue and mailbox must exist before any worker runs;
        // workers steal from each other's queues from their very first
        // iteration.
        let mut scheds = Vec::with_capacity(count);
        let mut pending = Vec::with_capacity(count);
        for (index, core) in assignment.workers.iter().copied().enumerate() {
            // SAFETY: actor pointers pushed into these queues are owned by
            // the engine and outlive their residence in any queue.
            let (queue, stealer) = unsafe { RunQueue::new() };
            scheds.push(SchedShared {
                mailbox: SchedMailbox::new(),
                stealer,
                cpu: core,
            });
            pending.push(Some(WorkerCtx::new(index, queue)));
        }

        // SAFETY: same pointer-validity guarantee as above.
        let inject = unsafe { InjectQueue::new() };

        asio.init(assignment.asio);

        log::debug!("scheduler runtime created with {count} workers");

        Arc::new(Self {
            scheds: scheds.into_boxed_slice(),
            inject,
            detect_quiescence: AtomicBool::new(false),
            use_yield: !options.noyield,
            nopin: options.nopin,
            engine,
            asio,
            cycle,
            pending: Mutex::new(pending),
            handles: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Starts the worker pool.
    ///
    /// With `library == false`, quiescence detection is armed and the call
    /// blocks until the program terminates, then shuts the runtime down.
    /// With `library == true`, the embedder drives lifetime and ends it
    /// with [`stop`](Runtime::stop).
    ///
    /// Returns `false` if ASIO fails to start, a worker thread cannot be
    /// spawned, or the pool was already started; the caller owns cleanup.
    pub fn start(self: &Arc<Self>, library: bool) -> bool {
        if !self.asio.start() {
            return false;
        }
        self.detect_quiescence.store(!library, Ordering::Relaxed);

        let workers: Vec<WorkerCtx> = {
            let mut pending = lock(&self.pending);
            if pending.iter().any(Option::is_none) {
                return false;
            }
            pending.iter_mut().filter_map(Option::take).collect()
        };

        log::debug!("starting {} workers (library={library})", workers.len());

        let mut handles = Vec::with_capacity(workers.len());
        let mut failed = false;
        for worker in workers {
            let index = worker.index;
            let rt = Arc::clone(self);
            match thread::Builder::new()
                .name(format!("froe-worker-{index}"))
                .spawn(move || run_thread(&rt, worker))
            {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        *lock(&self.handles) = handles;
        if failed {
            return false;
        }

        if !library {
            self.shutdown();
        }
        true
    }

    /// Arms quiescence detection and shuts the pool down.
    pub fn stop(&self) {
        self.detect_quiescence.store(true, Ordering::Relaxed);
        self.shutdown();
    }

    /// Joins every worker, winds down the cycle detector, and drains
    /// leftover control messages.
    fn shutdown(&self) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            let _ = handle.join();
        }

        if let Some(cycle) = &self.cycle {
            cycle.terminate();
        }

        // All workers are joined; this thread is now the sole consumer of
        // every mailbox.
        for sched in &self.scheds {
            // SAFETY: single consumer per the join above.
            while unsafe { sched.mailbox.pop() }.is_some() {}
        }

        log::debug!("scheduler runtime shut down");
    }

    /// Number of worker threads.
    #[must_use]
    pub fn cores(&self) -> u32 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "worker count is clamped to MAX_WORKERS (256)"
        )]
        {
            self.scheds.len() as u32
        }
    }

    fn scheduler_count(&self) -> usize {
        self.scheds.len()
    }

    fn send_msg(&self, to: usize, msg: SchedMsg) {
        self.scheds[to].mailbox.push(msg);
    }

    fn send_msg_all(&self, msg: SchedMsg) {
        for sched in &self.scheds {
            sched.mailbox.push(msg);
        }
    }

    /// Tells every worker that external event sources are registered.
    /// Upcall from the ASIO backend.
    pub fn noisy_asio(&self) {
        self.send_msg_all(SchedMsg::NoisyAsio);
    }

    /// Tells every worker that no external event sources remain.
    /// Upcall from the ASIO backend.
    pub fn unnoisy_asio(&self) {
        self.send_msg_all(SchedMsg::UnnoisyAsio);
    }

    /// Asks every worker to run unmute processing for `actor`, which may
    /// be a receiver key in any worker's mute map.
    pub fn start_global_unmute(&self, actor: *mut Actor) {
        self.counters.unmutes_broadcast.fetch_add(1, Ordering::Relaxed);
        self.send_msg_all(SchedMsg::UnmuteActor(actor));
    }

    /// Captures a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        Metrics {
            worker_count: self.scheds.len() as u64,
            actors_scheduled: self.counters.actors_scheduled.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
            blocks_sent: self.counters.blocks_sent.load(Ordering::Relaxed),
            unblocks_sent: self.counters.unblocks_sent.load(Ordering::Relaxed),
            cnf_rounds: self.counters.cnf_rounds.load(Ordering::Relaxed),
            stale_acks: self.counters.stale_acks.load(Ordering::Relaxed),
            unmutes_broadcast: self.counters.unmutes_broadcast.load(Ordering::Relaxed),
        }
    }
}

/// Mutex lock that shrugs off poisoning; worker state behind these locks
/// stays consistent across a panicking peer.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Scheduling primitives ───────────────────────────────────────────────

/// Schedules an actor: onto the current worker's queue when called from a
/// worker context, onto the inject queue otherwise.
pub fn schedule(ctx: &mut SchedCtx, actor: *mut Actor) {
    ctx.rt.counters.actors_scheduled.fetch_add(1, Ordering::Relaxed);
    match ctx.worker.as_ref() {
        Some(w) => w.queue.push(actor),
        None => ctx.rt.inject.push(actor),
    }
}

/// Pops the next actor: inject queue first, then the local queue. The
/// ordering bounds inject latency when external threads are producing.
fn pop_any(ctx: &mut SchedCtx) -> Option<*mut Actor> {
    let w = ctx.worker.as_ref().expect("requires a worker context");
    ctx.rt.inject.pop().or_else(|| w.queue.pop())
}

// ── Control-message handling ────────────────────────────────────────────

/// Drains the worker's mailbox. Returns `true` iff unmute processing put
/// new actors on the local run queue.
fn read_msg(ctx: &mut SchedCtx) -> bool {
    let mut run_queue_changed = false;

    loop {
        let msg = {
            let w = ctx.worker.as_ref().expect("requires a worker context");
            // SAFETY: this worker thread is the mailbox's only consumer.
            unsafe { ctx.rt.scheds[w.index].mailbox.pop() }
        };
        let Some(msg) = msg else { break };

        match msg {
            SchedMsg::Block => {
                let count = ctx.rt.scheduler_count();
                let detect = ctx.rt.detect_quiescence.load(Ordering::Relaxed);
                let w = ctx.worker.as_mut().expect("requires a worker context");
                w.block_count += 1;

                if detect && w.block_count == count {
                    // Everyone claims to be blocked: ask them to confirm.
                    let token = w.ack_token;
                    ctx.rt.counters.cnf_rounds.fetch_add(1, Ordering::Relaxed);
                    ctx.rt.send_msg_all(SchedMsg::Cnf(token));
                }
            }

            SchedMsg::Unblock => {
                let w = ctx.worker.as_mut().expect("requires a worker context");
                if w.asio_stopped {
                    // A worker coming back alive needs the I/O subsystem
                    // running again.
                    let restarted = ctx.rt.asio.start();
                    debug_assert!(restarted, "asio restart failed");
                    let _ = restarted;
                    w.asio_stopped = false;
                }

                // Cancel all outstanding acks: bump the token so pending
                // ACKs in flight are dropped on receipt.
                debug_assert!(w.block_count > 0, "unblock without block");
                w.block_count -= 1;
                w.ack_token = w.ack_token.wrapping_add(1);
                w.ack_count = 0;
            }

            SchedMsg::Cnf(token) => {
                // Echo the token straight back.
                ctx.rt.send_msg(COORDINATOR, SchedMsg::Ack(token));
            }

            SchedMsg::Ack(token) => {
                let w = ctx.worker.as_mut().expect("requires a worker context");
                if token == w.ack_token {
                    w.ack_count += 1;
                } else {
                    ctx.rt.counters.stale_acks.fetch_add(1, Ordering::Relaxed);
                }
            }

            SchedMsg::Terminate => {
                let w = ctx.worker.as_mut().expect("requires a worker context");
                w.terminate = true;
            }

            SchedMsg::UnmuteActor(actor) => {
                if unmute_senders(ctx, actor) {
                    run_queue_changed = true;
                }
            }

            SchedMsg::NoisyAsio => {
                ctx.worker.as_mut().expect("requires a worker context").asio_noisy = true;
            }

            SchedMsg::UnnoisyAsio => {
                ctx.worker.as_mut().expect("requires a worker context").asio_noisy = false;
            }
        }
    }

    run_queue_changed
}

// ── Quiescence ──────────────────────────────────────────────────────────

/// Idle-time termination check, called from the steal loop.
///
/// Two-phase commit on quiescence: the first CNF/ACK round establishes
/// that every worker believed itself blocked when asked. Only after ASIO
/// actually stops does a second round confirm that nobody unblocked (and
/// restarted ASIO) in between; any UNBLOCK bumps the token and aborts the
/// round in flight. TERMINATE goes out only once the second round
/// completes with ASIO already stopped.
fn quiescent(ctx: &mut SchedCtx, t1: u64, t2: u64) -> bool {
    let count = ctx.rt.scheduler_count();
    let w = ctx.worker.as_mut().expect("requires a worker context");

    if w.terminate {
        return true;
    }

    if w.ack_count == count {
        if w.asio_stopped {
            log::trace!("worker {} broadcasting terminate", w.index);
            ctx.rt.send_msg_all(SchedMsg::Terminate);
            w.ack_token = w.ack_token.wrapping_add(1);
            w.ack_count = 0;
        } else if ctx.rt.asio.stop() {
            w.asio_stopped = true;
            w.ack_token = w.ack_token.wrapping_add(1);
            w.ack_count = 0;

            // Run another CNF/ACK round against the stopped backend.
            ctx.rt.counters.cnf_rounds.fetch_add(1, Ordering::Relaxed);
            ctx.rt.send_msg_all(SchedMsg::Cnf(w.ack_token));
        }
    }

    cpu::core_pause(t1, t2, ctx.rt.use_yield);
    false
}

// ── Work stealing ───────────────────────────────────────────────────────

/// Picks the next victim in a rotating reverse scan, or `None` once the
/// rotation has come full circle (the scan then restarts at this worker).
fn choose_victim(w: &mut WorkerCtx, count: usize) -> Option<usize> {
    let start = w.last_victim;
    let mut victim = start;

    loop {
        // Back up one, wrapping to the end.
        victim = if victim == 0 { count - 1 } else { victim - 1 };

        if victim == start {
            // Tried every candidate; restart the rotation at ourselves.
            w.last_victim = w.index;
            return None;
        }

        if victim == w.index {
            continue;
        }

        w.last_victim = victim;
        return Some(victim);
    }
}

/// Steals until an actor is found or the program terminates.
///
/// Returns `None` only on termination.
fn steal(ctx: &mut SchedCtx) -> Option<*mut Actor> {
    let mut block_sent = false;
    let mut steal_attempts: usize = 0;
    let t1 = cpu::tick();

    let actor = loop {
        let count = ctx.rt.scheduler_count();
        let victim = choose_victim(
            ctx.worker.as_mut().expect("requires a worker context"),
            count,
        );

        let candidate = match victim {
            Some(v) => ctx
                .rt
                .inject
                .pop()
                .or_else(|| ctx.rt.scheds[v].stealer.steal()),
            None => ctx.rt.inject.pop(),
        };
        if let Some(found) = candidate {
            ctx.rt.counters.steals.fetch_add(1, Ordering::Relaxed);
            break found;
        }

        let t2 = cpu::tick();

        if read_msg(ctx) {
            // Unmute processing put an actor on our own queue. Another
            // worker may have stolen it already, so the pop can miss.
            if let Some(found) = pop_any(ctx) {
                break found;
            }
        }

        if quiescent(ctx, t1, t2) {
            return None;
        }

        // Blocked means: no noisy I/O that could produce outside work, no
        // muted senders parked here (those are deferred work), a full
        // rotation of failed steal attempts, and a sustained stretch of
        // idleness. Announcing earlier just churns BLOCK/UNBLOCK pairs in
        // quick-steal scenarios.
        if !block_sent {
            let w = ctx.worker.as_mut().expect("requires a worker context");
            if steal_attempts < count {
                steal_attempts += 1;
            } else if !w.asio_noisy
                && t2.saturating_sub(t1) > BLOCK_DELAY_NS
                && w.mute_map.is_empty()
            {
                ctx.rt.counters.blocks_sent.fetch_add(1, Ordering::Relaxed);
                ctx.rt.send_msg(COORDINATOR, SchedMsg::Block);
                block_sent = true;
            }
        }
    };

    if block_sent {
        // Pair the block announcement before going back to work.
        ctx.rt.counters.unblocks_sent.fetch_add(1, Ordering::Relaxed);
        ctx.rt.send_msg(COORDINATOR, SchedMsg::Unblock);
    }
    Some(actor)
}

// ── Worker loop ─────────────────────────────────────────────────────────

/// Dispatch loop, run by each worker thread until termination.
fn run(ctx: &mut SchedCtx) {
    let mut actor = pop_any(ctx);

    loop {
        // Reading messages may have unmuted an actor onto our queue; pick
        // it up if our hands are empty.
        if read_msg(ctx) && actor.is_none() {
            actor = pop_any(ctx);
        }

        let current = if let Some(current) = actor {
            current
        } else {
            match steal(ctx) {
                Some(stolen) => stolen,
                None => {
                    // Termination. The local queue must already be empty.
                    let w = ctx.worker.as_ref().expect("requires a worker context");
                    debug_assert!(w.queue.is_empty(), "terminating with queued actors");
                    return;
                }
            }
        };

        // Run a batch, then decide who gets the worker next.
        let engine = Arc::clone(&ctx.rt.engine);
        let reschedule = engine.run_actor(ctx, current, BATCH);
        let next = pop_any(ctx);

        if reschedule {
            if let Some(next) = next {
                // FIFO fairness: the just-run actor goes to the back of
                // the queue behind the one that was waiting.
                let w = ctx.worker.as_ref().expect("requires a worker context");
                w.queue.push(current);
                actor = Some(next);
            } else {
                // Nobody is waiting; keep running the same actor.
                actor = Some(current);
            }
        } else {
            actor = next;
        }
    }
}

/// Worker thread body: pin, build the context, dispatch until done.
fn run_thread(rt: &Arc<Runtime>, worker: WorkerCtx) {
    if !rt.nopin {
        if let Some(core) = rt.scheds[worker.index].cpu {
            cpu::set_affinity(core);
        }
    }

    let mut ctx = SchedCtx {
        rt: Arc::clone(rt),
        worker: Some(worker),
    };
    run(&mut ctx);
}

// ── Mute / unmute bookkeeping ───────────────────────────────────────────
//
// When an actor sends to an overloaded receiver, the worker executing the
// sender records the relation:
//
//   overloaded receiving actor => [sending actors]
//
// A given actor exists as a *sender* in at most one worker's mute map;
// receivers can be a key in several maps at once. Because muted senders
// sit in a single map and are never scheduled while muted, their mute
// count has one writer at a time even though it is declared atomic.

/// Mutes `sender` on behalf of the overloaded `recv` on the current
/// worker. The sender must currently be executing on this worker.
pub fn mute(ctx: &mut SchedCtx, sender: *mut Actor, recv: *mut Actor) {
    assert!(sender != recv, "an actor cannot be muted against itself");
    let w = ctx.worker.as_mut().expect("mute requires a worker context");

    if w.mute_map.insert(recv, sender) {
        // SAFETY: the engine keeps `sender` alive while it is scheduled or
        // muted; only this worker mutates the count (see above).
        unsafe {
            (*sender).muted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Releases every sender muted on behalf of `recv` on the current worker.
///
/// Senders whose mute count drops to zero are cleared in the engine,
/// rescheduled here, and announced to all workers — the unmuted actor may
/// itself be a receiver key in another worker's mute map. Returns `true`
/// iff any actor was rescheduled locally.
pub fn unmute_senders(ctx: &mut SchedCtx, recv: *mut Actor) -> bool {
    let w = ctx
        .worker
        .as_mut()
        .expect("unmute_senders requires a worker context");
    let Some(senders) = w.mute_map.remove(recv) else {
        return false;
    };

    // Drop each sender's mute count; stage the ones that hit zero.
    let mut needs_unmuting = Vec::new();
    for sender in senders {
        // SAFETY: senders recorded in the mute map are valid until
        // unmuted; only this worker mutates their count.
        let prev = unsafe { (*sender).muted.fetch_sub(1, Ordering::Relaxed) };
        debug_assert!(prev > 0, "muted count underflow");
        if prev == 1 {
            needs_unmuting.push(sender);
        }
    }

    let engine = Arc::clone(&ctx.rt.engine);
    let mut rescheduled = 0usize;
    for actor in needs_unmuting {
        // SAFETY: staged actors are valid per the mute-map contract.
        if !unsafe { &*actor }.is_unscheduled() {
            engine.unmute_actor(actor);
            schedule(ctx, actor);
            rescheduled += 1;
        }

        // Broadcast unconditionally: any other worker holding this actor
        // as a receiver key runs this same procedure for it.
        ctx.rt.start_global_unmute(actor);
    }

    rescheduled > 0
}

// ── Process-current runtime and per-thread context ──────────────────────

static CURRENT: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

thread_local! {
    /// Context slot for threads registered via [`register_thread`].
    /// Worker threads thread their context through calls instead.
    static CTX: Cell<*mut SchedCtx> = const { Cell::new(ptr::null_mut()) };
}

/// Creates the process-current runtime and registers the calling thread.
///
/// Returns `false` if a runtime is already installed.
pub fn init(
    options: Options,
    engine: Arc<dyn ActorEngine>,
    asio: Arc<dyn AsioBackend>,
    cycle: Option<Box<dyn CycleDetector>>,
) -> bool {
    let rt = Runtime::new(options, engine, asio, cycle);
    {
        let mut current = lock(&CURRENT);
        if current.is_some() {
            return false;
        }
        *current = Some(rt);
    }
    register_thread();
    true
}

/// The process-current runtime, if one is installed.
#[must_use]
pub fn current() -> Option<Arc<Runtime>> {
    lock(&CURRENT).clone()
}

/// Starts the process-current runtime. In non-library mode this blocks
/// until the program terminates and then retires the current handle.
pub fn start(library: bool) -> bool {
    let Some(rt) = current() else { return false };
    let ok = rt.start(library);
    if ok && !library {
        lock(&CURRENT).take();
    }
    ok
}

/// Stops and retires the process-current runtime.
pub fn stop() {
    let rt = lock(&CURRENT).take();
    if let Some(rt) = rt {
        rt.stop();
    }
}

/// Worker count of the process-current runtime (0 if none).
#[must_use]
pub fn cores() -> u32 {
    current().map_or(0, |rt| rt.cores())
}

/// Registers the calling non-worker thread so it can schedule actors.
/// Idempotent; must be paired with [`unregister_thread`]. A no-op when no
/// runtime is installed.
pub fn register_thread() {
    CTX.with(|slot| {
        if !slot.get().is_null() {
            return;
        }
        let Some(rt) = current() else { return };
        let ctx = Box::into_raw(Box::new(SchedCtx { rt, worker: None }));
        slot.set(ctx);
    });
}

/// Releases the calling thread's registration.
pub fn unregister_thread() {
    CTX.with(|slot| {
        let ctx = slot.replace(ptr::null_mut());
        if !ctx.is_null() {
            // SAFETY: the pointer was created by Box::into_raw in
            // register_thread and belongs exclusively to this thread.
            drop(unsafe { Box::from_raw(ctx) });
        }
    });
}

/// The calling thread's registered context.
///
/// # Panics
///
/// Panics if [`register_thread`] was not called on this thread.
#[must_use]
pub fn ctx() -> *mut SchedCtx {
    let ctx = CTX.with(Cell::get);
    assert!(!ctx.is_null(), "register_thread was not called");
    ctx
}

/// Broadcasts the noisy-ASIO notice on the process-current runtime.
pub fn noisy_asio() {
    if let Some(rt) = current() {
        rt.noisy_asio();
    }
}

/// Broadcasts the unnoisy-ASIO notice on the process-current runtime.
pub fn unnoisy_asio() {
    if let Some(rt) = current() {
        rt.unnoisy_asio();
    }
}

/// Broadcasts unmute processing for `actor` on the process-current
/// runtime.
pub fn start_global_unmute(actor: *mut Actor) {
    if let Some(rt) = current() {
        rt.start_global_unmute(actor);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::FLAG_UNSCHEDULED;
    use crate::asio::NullBackend;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    // ── Stub engines ────────────────────────────────────────────────────

    /// Engine for programs that schedule no actors.
    struct NoopEngine;

    impl ActorEngine for NoopEngine {
        fn run_actor(&self, _ctx: &mut SchedCtx, _actor: *mut Actor, _batch: u32) -> bool {
            false
        }

        fn unmute_actor(&self, _actor: *mut Actor) {}
    }

    /// Engine that counts batches and reschedules while `active`.
    struct SpinEngine {
        runs: AtomicU64,
        active: AtomicBool,
    }

    impl SpinEngine {
        fn new() -> Self {
            Self {
                runs: AtomicU64::new(0),
                active: AtomicBool::new(true),
            }
        }
    }

    impl ActorEngine for SpinEngine {
        fn run_actor(&self, _ctx: &mut SchedCtx, _actor: *mut Actor, _batch: u32) -> bool {
            self.runs.fetch_add(1, Ordering::Relaxed);
            self.active.load(Ordering::Relaxed)
        }

        fn unmute_actor(&self, _actor: *mut Actor) {}
    }

    /// Engine recording which actors were cleared by `unmute_actor`.
    struct RecordingEngine {
        unmuted: Mutex<Vec<usize>>,
    }

    impl RecordingEngine {
        fn new() -> Self {
            Self {
                unmuted: Mutex::new(Vec::new()),
            }
        }

        fn unmuted(&self) -> Vec<usize> {
            lock(&self.unmuted).clone()
        }
    }

    impl ActorEngine for RecordingEngine {
        fn run_actor(&self, _ctx: &mut SchedCtx, _actor: *mut Actor, _batch: u32) -> bool {
            false
        }

        fn unmute_actor(&self, actor: *mut Actor) {
            lock(&self.unmuted).push(actor as usize);
        }
    }

    // ── Harness helpers ─────────────────────────────────────────────────

    fn test_options(threads: u32) -> Options {
        Options {
            threads,
            noyield: false,
            nopin: true,
            pinasio: false,
        }
    }

    fn test_runtime(threads: u32) -> (Arc<Runtime>, Arc<NullBackend>) {
        test_runtime_with(threads, Arc::new(NoopEngine))
    }

    fn test_runtime_with(
        threads: u32,
        engine: Arc<dyn ActorEngine>,
    ) -> (Arc<Runtime>, Arc<NullBackend>) {
        let asio = Arc::new(NullBackend::new());
        let rt = Runtime::new(test_options(threads), engine, Arc::clone(&asio) as _, None);
        (rt, asio)
    }

    /// Takes a worker's context out of an un-started runtime so tests can
    /// hand-drive the protocol.
    fn take_ctx(rt: &Arc<Runtime>, index: usize) -> SchedCtx {
        let worker = lock(&rt.pending)[index].take().expect("worker available");
        SchedCtx {
            rt: Arc::clone(rt),
            worker: Some(worker),
        }
    }

    fn external_ctx(rt: &Arc<Runtime>) -> SchedCtx {
        SchedCtx {
            rt: Arc::clone(rt),
            worker: None,
        }
    }

    fn worker(ctx: &SchedCtx) -> &WorkerCtx {
        ctx.worker.as_ref().expect("worker context")
    }

    fn boxed_actor(id: u64) -> *mut Actor {
        Box::into_raw(Box::new(Actor::new(id)))
    }

    unsafe fn free_actor(actor: *mut Actor) {
        // SAFETY: tests only pass pointers from boxed_actor.
        drop(unsafe { Box::from_raw(actor) });
    }

    unsafe fn pop_mailbox(rt: &Runtime, index: usize) -> Option<SchedMsg> {
        // SAFETY: the runtime is not started; this test thread is the sole
        // consumer of every mailbox.
        unsafe { rt.scheds[index].mailbox.pop() }
    }

    // ── Victim rotation ─────────────────────────────────────────────────

    #[test]
    fn victim_rotation_scans_backward() {
        let (rt, _) = test_runtime(4);
        let mut ctx = take_ctx(&rt, 1);
        let w = ctx.worker.as_mut().unwrap();

        assert_eq!(choose_victim(w, 4), Some(0));
        assert_eq!(choose_victim(w, 4), Some(3));
        assert_eq!(choose_victim(w, 4), Some(2));
        // From 2, stepping back hits ourselves (1) which is skipped.
        assert_eq!(choose_victim(w, 4), Some(0));
    }

    #[test]
    fn victim_rotation_single_worker_has_no_victim() {
        let (rt, _) = test_runtime(1);
        let mut ctx = take_ctx(&rt, 0);
        let w = ctx.worker.as_mut().unwrap();

        assert_eq!(choose_victim(w, 1), None);
        assert_eq!(choose_victim(w, 1), None);
    }

    #[test]
    fn victim_rotation_two_workers_alternates_with_none() {
        let (rt, _) = test_runtime(2);
        let mut ctx = take_ctx(&rt, 1);
        let w = ctx.worker.as_mut().unwrap();

        assert_eq!(choose_victim(w, 2), Some(0));
        // From 0: step to 1 (self, skipped), step to 0 == start → no victim.
        assert_eq!(choose_victim(w, 2), None);
        assert_eq!(choose_victim(w, 2), Some(0));
    }

    // ── Scheduling primitives ───────────────────────────────────────────

    #[test]
    fn schedule_prefers_local_queue_in_worker_context() {
        let (rt, _) = test_runtime(2);
        let mut ctx = take_ctx(&rt, 0);
        let actor = boxed_actor(1);

        schedule(&mut ctx, actor);
        assert!(rt.inject.is_empty());
        assert_eq!(worker(&ctx).queue.pop(), Some(actor));

        // SAFETY: popped back out of the queue above.
        unsafe { free_actor(actor) };
    }

    #[test]
    fn schedule_from_external_context_uses_inject() {
        let (rt, _) = test_runtime(2);
        let mut ext = external_ctx(&rt);
        let actor = boxed_actor(1);

        schedule(&mut ext, actor);
        assert_eq!(rt.inject.pop(), Some(actor));

        // SAFETY: popped back out of the queue above.
        unsafe { free_actor(actor) };
    }

    #[test]
    fn pop_any_drains_inject_before_local() {
        let (rt, _) = test_runtime(2);
        let mut ctx = take_ctx(&rt, 0);
        let local = boxed_actor(1);
        let injected = boxed_actor(2);

        worker(&ctx).queue.push(local);
        rt.inject.push(injected);

        assert_eq!(pop_any(&mut ctx), Some(injected));
        assert_eq!(pop_any(&mut ctx), Some(local));
        assert_eq!(pop_any(&mut ctx), None);

        // SAFETY: both were popped back out above.
        unsafe {
            free_actor(local);
            free_actor(injected);
        }
    }

    // ── Work stealing ───────────────────────────────────────────────────

    #[test]
    fn steal_takes_oldest_from_victim() {
        let (rt, _) = test_runtime(2);
        let mut c0 = take_ctx(&rt, 0);
        let mut c1 = take_ctx(&rt, 1);

        let actors: Vec<_> = (0..10).map(boxed_actor).collect();
        for &actor in &actors {
            schedule(&mut c0, actor);
        }

        let stolen = steal(&mut c1).expect("victim had work");
        assert_eq!(stolen, actors[0], "stealer takes the queue head");

        let mut remaining = 0;
        while worker(&c0).queue.pop().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 9);

        // Immediate success: no block/unblock churn.
        assert_eq!(rt.metrics().blocks_sent, 0);

        for actor in actors {
            // SAFETY: every actor was drained from the queues above.
            unsafe { free_actor(actor) };
        }
    }

    #[test]
    fn steal_falls_back_to_inject_without_victims() {
        let (rt, _) = test_runtime(1);
        let mut c0 = take_ctx(&rt, 0);
        let actor = boxed_actor(1);

        rt.inject.push(actor);
        assert_eq!(steal(&mut c0), Some(actor));

        // SAFETY: returned by steal above.
        unsafe { free_actor(actor) };
    }

    // ── Quiescence protocol ─────────────────────────────────────────────

    #[test]
    fn all_blocked_starts_cnf_round() {
        let (rt, _) = test_runtime(4);
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        let mut c0 = take_ctx(&rt, 0);

        for _ in 0..4 {
            rt.send_msg(COORDINATOR, SchedMsg::Block);
        }
        read_msg(&mut c0);

        assert_eq!(worker(&c0).block_count, 4);
        assert_eq!(rt.metrics().cnf_rounds, 1);
        // The coordinator already answered its own CNF within the drain.
        assert_eq!(worker(&c0).ack_count, 1);
        // The other workers each got the confirmation request.
        for index in 1..4 {
            // SAFETY: runtime not started; we are the sole consumer.
            assert_eq!(unsafe { pop_mailbox(&rt, index) }, Some(SchedMsg::Cnf(0)));
            assert_eq!(unsafe { pop_mailbox(&rt, index) }, None);
        }
    }

    #[test]
    fn block_without_detection_stays_quiet() {
        let (rt, _) = test_runtime(4);
        let mut c0 = take_ctx(&rt, 0);

        for _ in 0..4 {
            rt.send_msg(COORDINATOR, SchedMsg::Block);
        }
        read_msg(&mut c0);

        assert_eq!(worker(&c0).block_count, 4);
        assert_eq!(rt.metrics().cnf_rounds, 0, "library mode never confirms");
    }

    #[test]
    fn unblock_aborts_round_and_stale_acks_are_dropped() {
        let (rt, _) = test_runtime(4);
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        let mut c0 = take_ctx(&rt, 0);

        for _ in 0..4 {
            rt.send_msg(COORDINATOR, SchedMsg::Block);
        }
        read_msg(&mut c0);
        assert_eq!(worker(&c0).ack_count, 1, "own ack only");

        // Two workers confirm...
        rt.send_msg(COORDINATOR, SchedMsg::Ack(0));
        rt.send_msg(COORDINATOR, SchedMsg::Ack(0));
        read_msg(&mut c0);
        assert_eq!(worker(&c0).ack_count, 3);

        // ...then one of them finds work and unblocks.
        rt.send_msg(COORDINATOR, SchedMsg::Unblock);
        read_msg(&mut c0);
        assert_eq!(worker(&c0).block_count, 3);
        assert_eq!(worker(&c0).ack_token, 1);
        assert_eq!(worker(&c0).ack_count, 0);

        // The last confirmation arrives late, carrying the old token.
        rt.send_msg(COORDINATOR, SchedMsg::Ack(0));
        read_msg(&mut c0);
        assert_eq!(worker(&c0).ack_count, 0);
        assert_eq!(rt.metrics().stale_acks, 1);

        // Not quiescent, and nobody was told to terminate: worker 1 only
        // ever saw the original confirmation request.
        assert!(!quiescent(&mut c0, 0, 0));
        assert!(!worker(&c0).terminate);
        // SAFETY: runtime not started; we are the sole consumer.
        assert_eq!(unsafe { pop_mailbox(&rt, 1) }, Some(SchedMsg::Cnf(0)));
        assert_eq!(unsafe { pop_mailbox(&rt, 1) }, None);
    }

    #[test]
    fn two_phase_quiescence_terminates_all_workers() {
        let (rt, asio) = test_runtime(2);
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        assert!(asio.start());
        let mut c0 = take_ctx(&rt, 0);
        let mut c1 = take_ctx(&rt, 1);

        // Phase 1: everyone announces blocked, confirmation round runs.
        rt.send_msg(COORDINATOR, SchedMsg::Block);
        rt.send_msg(COORDINATOR, SchedMsg::Block);
        read_msg(&mut c0);
        read_msg(&mut c1); // answers CNF(0)
        read_msg(&mut c0); // counts the answer
        assert_eq!(worker(&c0).ack_count, 2);
        assert!(asio.is_running(), "asio still up before phase 2");

        // Coordinator stops ASIO and opens the second round.
        assert!(!quiescent(&mut c0, 0, 0));
        assert!(!asio.is_running());
        assert!(worker(&c0).ack_count == 0 && worker(&c0).ack_token == 1);
        assert_eq!(rt.metrics().cnf_rounds, 2);

        // Phase 2: both confirm against the stopped backend.
        read_msg(&mut c0); // answers own CNF(1), counts it
        read_msg(&mut c1); // answers CNF(1)
        read_msg(&mut c0); // counts it
        assert_eq!(worker(&c0).ack_count, 2);
        assert!(!worker(&c0).terminate, "terminate only after second round");

        // Second round complete with ASIO stopped: terminate goes out.
        assert!(!quiescent(&mut c0, 0, 0));
        read_msg(&mut c0);
        read_msg(&mut c1);
        assert!(quiescent(&mut c0, 0, 0));
        assert!(quiescent(&mut c1, 0, 0));
    }

    #[test]
    fn unblock_restarts_stopped_asio() {
        let (rt, asio) = test_runtime(2);
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        assert!(asio.start());
        let mut c0 = take_ctx(&rt, 0);
        let mut c1 = take_ctx(&rt, 1);

        // Drive to the point where ASIO is stopped.
        rt.send_msg(COORDINATOR, SchedMsg::Block);
        rt.send_msg(COORDINATOR, SchedMsg::Block);
        read_msg(&mut c0);
        read_msg(&mut c1);
        read_msg(&mut c0);
        assert!(!quiescent(&mut c0, 0, 0));
        assert!(!asio.is_running());

        // A worker finds work after all: the round aborts and ASIO comes
        // back so external events can flow again.
        rt.send_msg(COORDINATOR, SchedMsg::Unblock);
        read_msg(&mut c0);
        assert!(asio.is_running());
        assert!(!worker(&c0).asio_stopped);
        assert_eq!(worker(&c0).ack_count, 0);
    }

    #[test]
    fn noisy_notices_flip_the_mirror() {
        let (rt, _) = test_runtime(2);
        let mut c1 = take_ctx(&rt, 1);

        rt.noisy_asio();
        read_msg(&mut c1);
        assert!(worker(&c1).asio_noisy);

        rt.unnoisy_asio();
        read_msg(&mut c1);
        assert!(!worker(&c1).asio_noisy);
    }

    #[test]
    fn terminate_message_ends_the_worker() {
        let (rt, _) = test_runtime(2);
        let mut c1 = take_ctx(&rt, 1);

        rt.send_msg(1, SchedMsg::Terminate);
        read_msg(&mut c1);
        assert!(quiescent(&mut c1, 0, 0));
    }

    // ── Mute / unmute ───────────────────────────────────────────────────

    #[test]
    fn mute_unmute_roundtrip() {
        let engine = Arc::new(RecordingEngine::new());
        let (rt, _) = test_runtime_with(2, Arc::clone(&engine) as _);
        let mut c1 = take_ctx(&rt, 1);
        let sender = boxed_actor(1);
        let recv = boxed_actor(2);

        mute(&mut c1, sender, recv);
        // SAFETY: boxed_actor pointers stay valid for the whole test.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 1);
        assert!(worker(&c1).mute_map.contains(recv, sender));

        // Muting the same relation again is idempotent.
        mute(&mut c1, sender, recv);
        // SAFETY: as above.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 1);

        assert!(unmute_senders(&mut c1, recv));
        // SAFETY: as above.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 0);
        assert!(worker(&c1).mute_map.is_empty());
        assert_eq!(engine.unmuted(), vec![sender as usize]);

        // The sender landed back on this worker's queue...
        assert_eq!(worker(&c1).queue.pop(), Some(sender));
        // ...and the unmute was announced to every worker, including us.
        // SAFETY: runtime not started; we are the sole consumer.
        assert_eq!(
            unsafe { pop_mailbox(&rt, 0) },
            Some(SchedMsg::UnmuteActor(sender))
        );
        assert!(!read_msg(&mut c1), "no senders muted for it here anymore");

        // SAFETY: drained from all queues above.
        unsafe {
            free_actor(sender);
            free_actor(recv);
        }
    }

    #[test]
    fn unmute_skips_unscheduled_actors_but_still_broadcasts() {
        let engine = Arc::new(RecordingEngine::new());
        let (rt, _) = test_runtime_with(2, Arc::clone(&engine) as _);
        let mut c1 = take_ctx(&rt, 1);
        let sender = boxed_actor(1);
        let recv = boxed_actor(2);

        mute(&mut c1, sender, recv);
        // SAFETY: boxed_actor pointer, valid for the test.
        unsafe { &*sender }.set_flag(FLAG_UNSCHEDULED);

        assert!(!unmute_senders(&mut c1, recv), "nothing rescheduled");
        // SAFETY: as above.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 0);
        assert!(worker(&c1).queue.pop().is_none());
        assert!(engine.unmuted().is_empty());
        // The broadcast still went out for the transitive receiver case.
        assert_eq!(rt.metrics().unmutes_broadcast, 1);

        // SAFETY: never entered any queue.
        unsafe {
            free_actor(sender);
            free_actor(recv);
        }
    }

    #[test]
    fn sender_muted_for_two_receivers_releases_on_the_last() {
        let engine = Arc::new(RecordingEngine::new());
        let (rt, _) = test_runtime_with(2, Arc::clone(&engine) as _);
        let mut c1 = take_ctx(&rt, 1);
        let sender = boxed_actor(1);
        let recv_a = boxed_actor(2);
        let recv_b = boxed_actor(3);

        mute(&mut c1, sender, recv_a);
        mute(&mut c1, sender, recv_b);
        // SAFETY: boxed_actor pointers, valid for the test.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 2);

        // First receiver drains: the sender is still muted elsewhere.
        assert!(!unmute_senders(&mut c1, recv_a));
        // SAFETY: as above.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 1);
        assert!(worker(&c1).queue.pop().is_none());
        assert_eq!(rt.metrics().unmutes_broadcast, 0);

        // Second receiver drains: now the sender runs again.
        assert!(unmute_senders(&mut c1, recv_b));
        // SAFETY: as above.
        assert_eq!(unsafe { &*sender }.muted.load(Ordering::Relaxed), 0);
        assert_eq!(worker(&c1).queue.pop(), Some(sender));
        assert_eq!(rt.metrics().unmutes_broadcast, 1);

        // SAFETY: drained above; receivers never entered a queue.
        unsafe {
            free_actor(sender);
            free_actor(recv_a);
            free_actor(recv_b);
        }
    }

    #[test]
    #[should_panic(expected = "cannot be muted against itself")]
    fn muting_an_actor_against_itself_is_a_contract_violation() {
        let (rt, _) = test_runtime(1);
        let mut c0 = take_ctx(&rt, 0);
        let actor = boxed_actor(1);

        mute(&mut c0, actor, actor);
    }

    // ── Whole-runtime scenarios ─────────────────────────────────────────

    #[test]
    fn empty_program_terminates_cleanly() {
        let (rt, asio) = test_runtime(4);

        assert!(rt.start(false), "blocks until the pool terminates");

        let m = rt.metrics();
        assert!(m.blocks_sent >= 4, "every worker announced blocked");
        assert!(m.cnf_rounds >= 2, "two-phase confirmation ran");
        assert!(!asio.is_running());
    }

    #[test]
    fn runtime_cannot_start_twice() {
        let (rt, _) = test_runtime(2);
        assert!(rt.start(true));
        assert!(!rt.start(true));

        // Wind down: arm detection, then wake the idle pool with one
        // throwaway actor so a fresh BLOCK wave reaches the coordinator.
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        let actor = boxed_actor(1);
        let mut ext = external_ctx(&rt);
        schedule(&mut ext, actor);
        rt.stop();

        // SAFETY: workers are joined; the actor is out of every queue.
        unsafe { free_actor(actor) };
    }

    #[test]
    fn long_running_actor_inhibits_termination() {
        let engine = Arc::new(SpinEngine::new());
        let (rt, _) = test_runtime_with(4, Arc::clone(&engine) as _);

        assert!(rt.start(true));

        let actor = boxed_actor(1);
        let mut ext = external_ctx(&rt);
        schedule(&mut ext, actor);

        thread::sleep(Duration::from_millis(50));
        assert!(
            engine.runs.load(Ordering::Relaxed) > 10,
            "actor kept running"
        );
        assert_eq!(
            rt.metrics().cnf_rounds,
            0,
            "holder never blocks, so confirmation never starts"
        );

        // Wind down: arm detection first, then let the actor finish.
        let stopper = {
            let rt = Arc::clone(&rt);
            thread::spawn(move || rt.stop())
        };
        thread::sleep(Duration::from_millis(10));
        engine.active.store(false, Ordering::Relaxed);
        stopper.join().expect("stop thread panicked");

        // SAFETY: workers are joined; the actor is out of every queue.
        unsafe { free_actor(actor) };
    }

    #[test]
    fn noisy_asio_inhibits_block_announcements() {
        let asio = Arc::new(NullBackend::new());
        asio.add_noisy();
        let rt = Runtime::new(
            test_options(4),
            Arc::new(NoopEngine),
            Arc::clone(&asio) as _,
            None,
        );

        // The notice is queued before any worker runs.
        rt.noisy_asio();
        assert!(rt.start(true));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            rt.metrics().blocks_sent,
            0,
            "idle workers must stay silent while I/O is noisy"
        );

        // Arm detection before lifting the notice so the first BLOCK wave
        // already counts, then shut down.
        rt.detect_quiescence.store(true, Ordering::Relaxed);
        asio.remove_noisy();
        rt.unnoisy_asio();
        rt.stop();

        assert!(rt.metrics().blocks_sent >= 4);
        assert!(!asio.is_running());
    }

    #[test]
    fn shutdown_invokes_cycle_detector_once() {
        struct CountingCycle(Arc<AtomicU64>);
        impl CycleDetector for CountingCycle {
            fn terminate(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hits = Arc::new(AtomicU64::new(0));
        let rt = Runtime::new(
            test_options(2),
            Arc::new(NoopEngine),
            Arc::new(NullBackend::new()),
            Some(Box::new(CountingCycle(Arc::clone(&hits)))),
        );

        assert!(rt.start(false));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    // ── Process-current layer ───────────────────────────────────────────

    #[test]
    fn module_level_lifecycle() {
        let engine = Arc::new(NoopEngine);
        let asio = Arc::new(NullBackend::new());

        assert!(init(test_options(2), engine, asio, None));
        assert_eq!(cores(), 2);
        assert!(!ctx().is_null(), "init registered this thread");

        // A second runtime cannot be installed while one is current.
        assert!(!init(
            test_options(2),
            Arc::new(NoopEngine),
            Arc::new(NullBackend::new()),
            None
        ));

        // Empty program: start in non-library mode runs to termination
        // and retires the current handle.
        assert!(start(false));
        assert!(current().is_none());

        unregister_thread();
    }
}
