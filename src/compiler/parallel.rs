//! Pull-based parallel iteration over index ranges.
//!
//! Every driver phase is a loop over class definition or method indices with highly variable
//! per-index cost. [`ParallelCompilationManager::for_all`] hands indices out through a shared
//! atomic cursor, so a worker that finishes early simply claims the next index:
//!
//! ```text
//!   cursor ──► [ begin ........................................ end )
//!                 ▲ fetch_add   ▲ fetch_add   ▲ fetch_add
//!              worker 0      worker 1      worker 2   ...
//! ```
//!
//! Each worker owns a state value (typically an [`super::AotCompilationStats`]) that is returned
//! to the caller for merging once every worker has finished.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{Error, Result};

/// Worker pool shared by every phase of a driver.
pub struct ParallelCompilationManager {
    pool: ThreadPool,
    thread_count: usize,
}

impl ParallelCompilationManager {
    /// Creates a pool for `thread_count` total threads. One thread is reserved for the caller,
    /// which only waits while the workers run.
    ///
    /// # Errors
    /// Returns an error if the worker threads cannot be spawned.
    pub fn new(thread_count: usize) -> Result<Self> {
        let workers = thread_count.saturating_sub(1).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("compiler-worker-{i}"))
            .build()
            .map_err(|e| Error::Error(format!("Failed to create the compiler thread pool: {e}")))?;
        Ok(ParallelCompilationManager {
            pool,
            thread_count: workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Calls `work` for every index in `begin..end` on up to `threads` workers and returns the
    /// per-worker states.
    ///
    /// With `threads == 1` the indices are processed in order on the calling thread, which is
    /// what deterministic phases rely on. Otherwise all workers are submitted before the caller
    /// blocks, and the call returns once every index has been processed.
    pub fn for_all<S, F>(&self, begin: usize, end: usize, threads: usize, work: F) -> Vec<S>
    where
        S: Default + Send,
        F: Fn(&mut S, usize) + Sync,
    {
        let cursor = AtomicUsize::new(begin);
        let run = |state: &mut S| loop {
            let index = cursor.fetch_add(1, Ordering::Relaxed);
            if index >= end {
                break;
            }
            work(state, index);
        };

        let threads = threads.clamp(1, self.thread_count);
        if threads == 1 || end.saturating_sub(begin) <= 1 {
            let mut state = S::default();
            run(&mut state);
            return vec![state];
        }

        self.pool.install(|| {
            (0..threads)
                .into_par_iter()
                .map(|_| {
                    let mut state = S::default();
                    run(&mut state);
                    state
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for ParallelCompilationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCompilationManager")
            .field("thread_count", &self.thread_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_every_index_claimed_once() {
        let manager = ParallelCompilationManager::new(4).unwrap();
        let seen = Mutex::new(Vec::new());
        let counts: Vec<usize> = manager.for_all(10, 110, 4, |count: &mut usize, index| {
            *count += 1;
            seen.lock().unwrap().push(index);
        });

        assert_eq!(counts.iter().sum::<usize>(), 100);
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (10..110).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_thread_is_ordered() {
        let manager = ParallelCompilationManager::new(8).unwrap();
        let states: Vec<Vec<usize>> = manager.for_all(0, 20, 1, |order: &mut Vec<usize>, index| {
            order.push(index);
        });
        assert_eq!(states.len(), 1);
        assert_eq!(states[0], (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_range() {
        let manager = ParallelCompilationManager::new(2).unwrap();
        let states: Vec<usize> = manager.for_all(5, 5, 2, |count: &mut usize, _| *count += 1);
        assert_eq!(states.iter().sum::<usize>(), 0);
    }
}
