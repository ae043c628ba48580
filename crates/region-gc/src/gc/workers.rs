//! GC worker pool.
//!
//! Workers are scoped threads spawned per parallel phase. Items are handed out
//! through a shared cursor so a worker that finishes early picks up more work;
//! every worker keeps its own result list and the lists are returned in worker
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Runs parallel collector phases on up to `count` threads.
#[derive(Debug, Clone, Copy)]
pub struct GcWorkers {
    count: usize,
}

impl GcWorkers {
    /// Creates a pool of `count` workers (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Calls `f(item, out)` for every item; `out` is the calling worker's
    /// result list.
    ///
    /// With one worker or a single item the calling thread does the work.
    pub fn for_each<I, R, F>(&self, items: &[I], f: F) -> Vec<Vec<R>>
    where
        I: Sync,
        R: Send,
        F: Fn(&I, &mut Vec<R>) + Sync,
    {
        let workers = self.count.min(items.len());
        if workers <= 1 {
            let mut out = Vec::new();
            for item in items {
                f(item, &mut out);
            }
            return vec![out];
        }

        let cursor = AtomicUsize::new(0);
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut out = Vec::new();
                        loop {
                            let index = cursor.fetch_add(1, Ordering::Relaxed);
                            let Some(item) = items.get(index) else { break };
                            f(item, &mut out);
                        }
                        out
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(out) => out,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Runs `f(worker_index)` on every worker and waits for all of them.
    pub fn run<F>(&self, f: F)
    where
        F: Fn(usize) + Sync,
    {
        if self.count == 1 {
            f(0);
            return;
        }
        thread::scope(|scope| {
            for index in 0..self.count {
                let f = &f;
                scope.spawn(move || f(index));
            }
        });
    }
}
