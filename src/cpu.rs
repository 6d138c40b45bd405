//! CPU services: core enumeration, worker/ASIO core assignment, thread
//! pinning, a monotonic tick, and the idle-pause primitive used by the
//! quiescence loop.
//!
//! Pinning goes through the `core_affinity` crate. The tick is a
//! process-epoch monotonic clock in nanoseconds; the steal loop uses it to
//! decide when an idle worker has been idle long enough to announce
//! itself blocked.

use std::sync::OnceLock;
use std::time::Instant;

pub use core_affinity::CoreId;

/// Idle spans shorter than this keep spinning; longer spans may yield to
/// the OS scheduler (see [`core_pause`]).
const PAUSE_SPIN_NS: u64 = 10_000_000;

/// Returns the number of CPUs available to this process (at least 1,
/// falls back to 4 when the OS cannot say).
#[must_use]
pub fn count() -> u32 {
    let n = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Core assignment for a worker pool plus the ASIO thread.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// One entry per worker; `None` means "leave unpinned".
    pub workers: Vec<Option<CoreId>>,
    /// Dedicated core for the ASIO thread, when one was requested and a
    /// spare core exists.
    pub asio: Option<CoreId>,
}

/// Distributes CPU cores across `workers` worker threads.
///
/// Cores are handed out round-robin in enumeration order. With `pinasio`,
/// the ASIO thread gets the first core beyond the workers if the machine
/// has one to spare; otherwise it stays unpinned. With `nopin`, nothing
/// is pinned at all.
#[must_use]
pub fn assign(workers: usize, nopin: bool, pinasio: bool) -> Assignment {
    if nopin {
        return Assignment {
            workers: vec![None; workers],
            asio: None,
        };
    }

    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        return Assignment {
            workers: vec![None; workers],
            asio: None,
        };
    };

    let assigned = (0..workers).map(|i| Some(cores[i % cores.len()])).collect();
    let asio = if pinasio && cores.len() > workers {
        Some(cores[workers])
    } else {
        None
    };

    Assignment {
        workers: assigned,
        asio,
    }
}

/// Pins the calling thread to `core`. Failure is non-fatal; affinity is a
/// throughput hint.
pub fn set_affinity(core: CoreId) {
    if !core_affinity::set_for_current(core) {
        log::debug!("failed to pin thread to core {core:?}");
    }
}

/// Monotonic nanoseconds since the first call in this process.
///
/// Stands in for a raw cycle counter; on contemporary hardware a cycle is
/// on the order of a nanosecond, so thresholds expressed in cycles carry
/// over unchanged.
#[must_use]
pub fn tick() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    #[expect(
        clippy::cast_possible_truncation,
        reason = "u64 nanoseconds cover centuries of process uptime"
    )]
    {
        epoch.elapsed().as_nanos() as u64
    }
}

/// Idle pause between steal attempts.
///
/// `t1` is when the idle period began, `t2` is now. Short idle spans spin
/// (the next steal attempt usually succeeds); once the worker has been
/// idle for a while it yields its timeslice, unless the embedder asked
/// for busy-waiting.
pub fn core_pause(t1: u64, t2: u64, use_yield: bool) {
    if use_yield && t2.saturating_sub(t1) >= PAUSE_SPIN_NS {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}
