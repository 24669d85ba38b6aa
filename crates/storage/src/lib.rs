//! Outcore Storage Library
//!
//! Append-only, memory-mapped spill storage shared by the resource cache and
//! the streaming pipeline, plus the metrics sink both report to.
//!
//! # Example
//!
//! ```
//! use outcore_storage::{BackingStore, BackingStoreConfig};
//!
//! let store = BackingStore::open(BackingStoreConfig::default()).unwrap();
//!
//! let span = store.append(b"evicted payload").unwrap();
//! let bytes = store.read(span).unwrap();
//! assert_eq!(&bytes[..], b"evicted payload");
//! ```

mod backing;
mod error;
pub mod metrics;

pub use backing::{BackingStore, BackingStoreConfig, Span, DEFAULT_CHUNK_SIZE};
pub use error::StorageError;
pub use metrics::{Counter, Gauge, InMemoryMetrics, MetricsSink, NoopMetrics};
