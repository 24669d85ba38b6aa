//! Outcore Scheduler Library
//!
//! Streaming pipeline runtime: [`DataChannel`]s carry batches between
//! stages and spill to disk under backpressure, and a [`TaskPool`] runs
//! source and transform tasks on a fixed set of worker threads until every
//! channel is drained.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use outcore_scheduler::{IterSource, PipelineConfig, TaskError, TaskPool};
//! use outcore_storage::NoopMetrics;
//!
//! let mut pool = TaskPool::open(PipelineConfig::default(), Arc::new(NoopMetrics)).unwrap();
//! let words = pool.channel::<String>("words");
//! let lengths = pool.channel::<usize>("lengths");
//!
//! let text = ["out", "of", "core"].map(String::from);
//! pool.add_source("words", IterSource::new(text.into_iter(), 2), &words);
//! pool.add_transform(
//!     "measure",
//!     &words,
//!     |batch: Vec<String>| -> Result<Vec<usize>, TaskError> {
//!         Ok(batch.iter().map(String::len).collect())
//!     },
//!     Some(&lengths),
//! );
//!
//! pool.run().unwrap();
//! let total: usize = lengths.consume().flat_map(|batch| batch.unwrap()).sum();
//! assert_eq!(total, 9);
//! ```

mod cancel;
mod channel;
pub mod config;
mod error;
mod pool;
mod task;
mod worker;

pub use cancel::CancellationToken;
pub use channel::{
    ChannelConfig, ChannelError, ChannelId, Consumer, DataChannel, Undelivered,
    DEFAULT_SPILL_THRESHOLD,
};
pub use config::PipelineConfig;
pub use error::{ConfigError, PipelineError};
pub use pool::{PipelineReport, TaskPool, TaskReport};
pub use task::{IterSource, Producer, TaskError, TaskId, TaskKind, TaskState};
pub use worker::WorkerPoolConfig;
