//! Worker grid that stands in for the accelerator's flat thread grid.
//!
//! Every engine call launches `threads` workers with `thread::scope`. Worker
//! `w` handles batch indices `w, w + threads, w + 2 * threads, …`. Leaving the
//! scope joins every worker, which is the end-of-call synchronization point:
//! all bucket and output writes are visible to the caller afterwards.
use std::ops::AddAssign;
use std::sync::Barrier;
use std::thread;

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads write to disjoint memory regions.
#[derive(Copy, Clone)]
pub(crate) struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub(crate) fn new(slice: &mut [T]) -> Self {
        Self(slice.as_mut_ptr())
    }

    /// Mutable view of row `index` of a row-major buffer with `width` columns.
    ///
    /// # Safety
    ///
    /// The row must be in bounds of the original slice and no other worker
    /// may access it while the returned slice is alive.
    #[inline(always)]
    pub(crate) unsafe fn row<'a>(self, index: usize, width: usize) -> &'a mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.0.add(index * width), width) }
    }
}

/// Identity of one worker within a launch.
#[derive(Copy, Clone, Debug)]
pub struct Worker {
    pub id: usize,
    pub threads: usize,
}

impl Worker {
    /// Batch indices owned by this worker.
    #[inline]
    pub fn indices(&self, n: usize) -> impl Iterator<Item = usize> {
        (self.id..n).step_by(self.threads)
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.id == 0
    }
}

pub struct Grid {
    threads: usize,
}

impl Grid {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Grid for a batch of `n` items: never more workers than items.
    pub fn for_batch(threads: usize, n: usize) -> Self {
        Self::new(threads.min(n))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Grid-wide barrier sized for this launch.
    pub fn barrier(&self) -> Barrier {
        Barrier::new(self.threads)
    }

    /// Runs `kernel` once per worker and returns the per-worker results in
    /// worker order. A single-worker grid runs inline on the caller thread.
    pub fn run<R, F>(&self, kernel: F) -> Vec<R>
    where
        F: Fn(Worker) -> R + Sync,
        R: Send,
    {
        let threads = self.threads;
        if threads == 1 {
            return vec![kernel(Worker { id: 0, threads })];
        }
        thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|id| {
                    let kernel = &kernel;
                    s.spawn(move || kernel(Worker { id, threads }))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

/// Per-call counters, summed over all workers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Keys in the batch.
    pub keys: usize,
    /// Buckets claimed for keys that were not in the table.
    pub inserted: usize,
    /// Keys resolved to an existing bucket.
    pub found: usize,
    /// Existing buckets whose `EVICTED` flag this call cleared.
    pub recovered: usize,
    /// Keys that found neither a free nor a matching bucket.
    pub dropped: usize,
    /// Keys absent from the table on a read-only path.
    pub missing: usize,
    /// Keys skipped because they equal the ignore sentinel.
    pub skipped: usize,
    /// Lowest batch index that was dropped or missing.
    pub first_failure: Option<usize>,
}

impl CallStats {
    pub(crate) fn fail(&mut self, index: usize) {
        self.first_failure = Some(self.first_failure.map_or(index, |f| f.min(index)));
    }

    pub fn merge(parts: impl IntoIterator<Item = CallStats>) -> Self {
        let mut total = CallStats::default();
        for part in parts {
            total += part;
        }
        total
    }
}

impl AddAssign for CallStats {
    fn add_assign(&mut self, rhs: Self) {
        self.keys += rhs.keys;
        self.inserted += rhs.inserted;
        self.found += rhs.found;
        self.recovered += rhs.recovered;
        self.dropped += rhs.dropped;
        self.missing += rhs.missing;
        self.skipped += rhs.skipped;
        if let Some(index) = rhs.first_failure {
            self.fail(index);
        }
    }
}
