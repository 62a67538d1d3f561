//! Supervised, bounded worker pool
//!
//! Provides:
//! - A hard cap on simultaneously running workers
//! - Panic isolation: a panicking worker is reported as a [`WorkerFault`]
//!   tagged with its key instead of tearing down the caller
//! - Pool health statistics

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;

/// Why a worker produced no output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFault {
    /// Worker panicked
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers started
    pub spawned: usize,
    /// Workers that returned normally
    pub completed: usize,
    /// Workers that panicked
    pub panicked: usize,
    /// Highest number of simultaneous workers seen
    pub peak_in_flight: usize,
}

/// Bounded pool of keyed async workers
#[derive(Debug)]
pub struct WorkerPool<K, T> {
    capacity: usize,
    tasks: JoinSet<(K, Result<T, WorkerFault>)>,
    stats: PoolStats,
}

impl<K, T> WorkerPool<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    /// Create new pool
    #[inline]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tasks: JoinSet::new(),
            stats: PoolStats::default(),
        }
    }

    /// Whether another worker may start
    #[inline]
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.capacity
    }

    /// Workers currently running
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no worker is running
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Current statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Start a worker
    ///
    /// Callers check [`has_capacity`](Self::has_capacity) first; the pool
    /// does not queue.
    pub fn spawn<F>(&mut self, key: K, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        debug_assert!(self.has_capacity(), "worker pool over capacity");
        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|payload| WorkerFault::Panicked(panic_message(payload.as_ref())));
            (key, outcome)
        });
        self.stats.spawned += 1;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.tasks.len());
    }

    /// Wait for the next worker to finish
    ///
    /// Returns `None` once the pool is idle.
    pub async fn join_next(&mut self) -> Option<(K, Result<T, WorkerFault>)> {
        loop {
            match self.tasks.join_next().await? {
                Ok((key, outcome)) => {
                    match &outcome {
                        Ok(_) => self.stats.completed += 1,
                        Err(fault) => {
                            self.stats.panicked += 1;
                            tracing::error!(error = %fault, "worker fault");
                        }
                    }
                    return Some((key, outcome));
                }
                // Panics are caught inside the task, so only aborts land here
                Err(e) => tracing::debug!(error = %e, "worker task aborted"),
            }
        }
    }

    /// Abort every running worker
    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn respects_capacity_and_reports_results() {
        let mut pool: WorkerPool<usize, usize> = WorkerPool::new(2);
        pool.spawn(1, async { 10 });
        pool.spawn(2, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            20
        });
        assert!(!pool.has_capacity());

        let mut results = Vec::new();
        while let Some((key, outcome)) = pool.join_next().await {
            results.push((key, outcome.unwrap()));
        }
        results.sort_unstable();
        assert_eq!(results, vec![(1, 10), (2, 20)]);
        assert_eq!(pool.stats().completed, 2);
        assert_eq!(pool.stats().peak_in_flight, 2);
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let mut pool: WorkerPool<&'static str, ()> = WorkerPool::new(4);
        pool.spawn("boom", async { panic!("producer exploded") });
        pool.spawn("fine", async {});

        let mut faults = Vec::new();
        while let Some((key, outcome)) = pool.join_next().await {
            if let Err(fault) = outcome {
                faults.push((key, fault));
            }
        }
        assert_eq!(
            faults,
            vec![("boom", WorkerFault::Panicked("producer exploded".into()))]
        );
        let stats = pool.stats();
        assert_eq!((stats.spawned, stats.completed, stats.panicked), (2, 1, 1));
    }

    #[tokio::test]
    async fn shutdown_drains_to_idle() {
        let mut pool: WorkerPool<u8, ()> = WorkerPool::new(1);
        pool.spawn(0, std::future::pending());
        pool.shutdown();
        assert!(pool.join_next().await.is_none());
    }
}
