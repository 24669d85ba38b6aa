//! Outcore Cache Library
//!
//! Out-of-core resource cache: registered resources stay addressable through
//! typed handles while the least recently used ones are spilled to a
//! memory-mapped backing store to keep resident bytes within a budget.
//!
//! # Example
//!
//! ```
//! use outcore_cache::{Builder, Residency};
//!
//! let mut builder = Builder::new();
//! let first = builder.register(vec![0u8; 600]);
//! let second = builder.register(vec![1u8; 600]);
//! let cache = builder.build(1000).unwrap();
//!
//! // Touching `second` pushes usage over budget; `first` is least recent.
//! let guard = cache.get(second).unwrap();
//! assert_eq!(guard[0], 1);
//! assert_eq!(cache.residency(first).unwrap(), Residency::Evicted);
//! ```

pub mod config;
mod error;
mod evictable;
mod handle;
mod lru;
pub mod memory_budget;

pub use config::{CacheConfig, ConfigError};
pub use error::CacheError;
pub use evictable::Evictable;
pub use handle::{CacheHandle, ResourceId};
pub use lru::{AccessGuard, Builder, CacheStats, LRUCache, Residency};
pub use memory_budget::{MemoryBudget, MemoryPressure};
