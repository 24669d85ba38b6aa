//! Fixed-size worker threads for pipeline execution.
//!
//! Workers are scoped threads borrowing the pool; they exit on their own
//! once the pool reports there is nothing left to schedule.

use std::io;
use std::thread;
use std::time::Duration;

/// Configuration for the pipeline worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time an idle worker waits before looking for work again.
    /// Default: 10ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Run `body(worker_id)` on `num_workers` named threads and wait for all of them.
///
/// If a thread cannot be spawned, the workers already started still run to
/// completion before the error is returned.
pub(crate) fn run_workers<F>(config: &WorkerPoolConfig, body: F) -> io::Result<()>
where
    F: Fn(usize) + Sync,
{
    let body = &body;
    thread::scope(|scope| -> io::Result<()> {
        for id in 0..config.num_workers.max(1) {
            thread::Builder::new()
                .name(format!("outcore-worker-{}", id))
                .spawn_scoped(scope, move || body(id))?;
        }
        Ok(())
    })
}

/// Get the number of logical CPU cores.
///
/// This is used as the default number of worker threads.
pub(crate) fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
