//! Metrics sink for cache and pipeline counters
//!
//! The cache, the backing store and the data channels report named counters
//! to a sink handed to them at construction. Aggregation and export belong to
//! whoever implements [`MetricsSink`]; [`InMemoryMetrics`] is a ready-made
//! collector that keeps running totals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters reported by the cache and the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    /// Resident bytes released by eviction
    BytesEvicted,
    /// Bytes copied into backing chunks
    DiskBytesWritten,
    /// Bytes copied out of backing chunks
    DiskBytesRead,
    /// Batches handed to a consumer
    BatchesFlushed,
    /// Batches moved from a channel to backing storage
    BatchesSpilled,
    /// Resources moved from resident to evicted
    Evictions,
    /// Resources moved from evicted to resident
    Promotions,
    /// Eviction passes that could not bring usage under budget
    BudgetOverruns,
    /// Chunk files created by a backing store
    ChunksAllocated,
}

impl Counter {
    pub const ALL: [Counter; 9] = [
        Counter::BytesEvicted,
        Counter::DiskBytesWritten,
        Counter::DiskBytesRead,
        Counter::BatchesFlushed,
        Counter::BatchesSpilled,
        Counter::Evictions,
        Counter::Promotions,
        Counter::BudgetOverruns,
        Counter::ChunksAllocated,
    ];

    /// Stable name used when exporting the counter.
    pub fn name(self) -> &'static str {
        match self {
            Counter::BytesEvicted => "bytes_evicted",
            Counter::DiskBytesWritten => "disk_bytes_written",
            Counter::DiskBytesRead => "disk_bytes_read",
            Counter::BatchesFlushed => "batches_flushed",
            Counter::BatchesSpilled => "batches_spilled",
            Counter::Evictions => "evictions",
            Counter::Promotions => "promotions",
            Counter::BudgetOverruns => "budget_overruns",
            Counter::ChunksAllocated => "chunks_allocated",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Point-in-time values reported by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gauge {
    /// Bytes currently resident in memory
    BytesResident,
}

impl Gauge {
    /// Stable name used when exporting the gauge.
    pub fn name(self) -> &'static str {
        match self {
            Gauge::BytesResident => "bytes_resident",
        }
    }
}

/// Receiver for counters and gauges.
///
/// Implementations must be cheap to call; they are invoked on hot paths
/// while locks may be held.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to a counter.
    fn increment(&self, counter: Counter, value: u64);

    /// Record the latest value of a gauge.
    fn gauge(&self, gauge: Gauge, value: u64);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: Counter, _value: u64) {}

    fn gauge(&self, _gauge: Gauge, _value: u64) {}
}

/// Sink that keeps running totals in atomics.
///
/// # Example
///
/// ```
/// use outcore_storage::{Counter, InMemoryMetrics, MetricsSink};
///
/// let metrics = InMemoryMetrics::new();
/// metrics.increment(Counter::Evictions, 2);
/// assert_eq!(metrics.counter(Counter::Evictions), 2);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: [AtomicU64; Counter::ALL.len()],
    bytes_resident: AtomicU64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current total of a counter.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Last recorded value of a gauge.
    pub fn gauge_value(&self, gauge: Gauge) -> u64 {
        match gauge {
            Gauge::BytesResident => self.bytes_resident.load(Ordering::Relaxed),
        }
    }

    /// All counters and gauges keyed by their export name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let mut values: BTreeMap<&'static str, u64> = Counter::ALL
            .iter()
            .map(|counter| (counter.name(), self.counter(*counter)))
            .collect();
        values.insert(Gauge::BytesResident.name(), self.gauge_value(Gauge::BytesResident));
        values
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    fn gauge(&self, gauge: Gauge, value: u64) {
        match gauge {
            Gauge::BytesResident => self.bytes_resident.store(value, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }

    #[test]
    fn test_in_memory_metrics_accumulates() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(Counter::DiskBytesWritten, 100);
        metrics.increment(Counter::DiskBytesWritten, 28);
        metrics.gauge(Gauge::BytesResident, 512);
        metrics.gauge(Gauge::BytesResident, 256);

        assert_eq!(metrics.counter(Counter::DiskBytesWritten), 128);
        assert_eq!(metrics.counter(Counter::DiskBytesRead), 0);
        assert_eq!(metrics.gauge_value(Gauge::BytesResident), 256);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["disk_bytes_written"], 128);
        assert_eq!(snapshot["bytes_resident"], 256);
        assert_eq!(snapshot.len(), Counter::ALL.len() + 1);
    }

    #[test]
    fn test_in_memory_metrics_concurrent_increments() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment(Counter::Promotions, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.counter(Counter::Promotions), 4000);
    }
}
