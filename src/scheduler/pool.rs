//! Worker pool and chunk planning.

use core::ops::Range;
use tracing::{error, info};

/// A dedicated rayon pool sized from the runtime configuration.
///
/// If the pool cannot be built, work runs on rayon's global pool instead.
#[derive(Debug)]
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl WorkerPool {
    /// Builds a pool of `num_threads` named workers (at least one).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        match rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("tensor-dispatch-worker-{i}"))
            .build()
        {
            Ok(pool) => {
                info!(workers = num_threads, "worker pool started");
                Self {
                    pool: Some(pool),
                    workers: num_threads,
                }
            }
            Err(err) => {
                error!(%err, "failed to build worker pool, using the global rayon pool");
                Self {
                    pool: None,
                    workers: rayon::current_num_threads().max(1),
                }
            }
        }
    }

    /// Worker count used for fan-out planning.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `op` inside the pool so nested parallel iterators use its workers.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

/// Splits `0..units` into `chunks` contiguous ranges whose lengths differ by
/// at most one, longer ranges first.
///
/// `chunks` is clamped to `1..=units`; zero units yield one empty range.
#[must_use]
pub fn plan_chunks(units: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.clamp(1, units.max(1));
    let base = units / chunks;
    let extra = units % chunks;
    let mut start = 0;
    (0..chunks)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Splits `data` into consecutive mutable pieces, each `scale` times the
/// length of the matching range.
pub(crate) fn split_by_ranges<'a, T>(
    data: &'a mut [T],
    ranges: &[Range<usize>],
    scale: usize,
) -> Vec<&'a mut [T]> {
    let mut rest = data;
    let mut pieces = Vec::with_capacity(ranges.len());
    for range in ranges {
        let (head, tail) = core::mem::take(&mut rest).split_at_mut(range.len() * scale);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

/// A host-side lock that must be released while long kernels run, such as an
/// embedding interpreter's global lock.
pub trait HostLock: Sync {
    /// Runs `f` with the lock released, reacquiring it before returning.
    fn allow_threads<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send;
}

/// No host lock: `allow_threads` just calls `f`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostLock;

impl HostLock for NoHostLock {
    fn allow_threads<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        f()
    }
}
