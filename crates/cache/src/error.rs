use outcore_storage::StorageError;

use crate::ResourceId;

/// Errors returned by the resource cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Handle used against a cache that did not mint it.
    #[error("invalid handle for resource {0}")]
    InvalidHandle(ResourceId),
    /// A resource could not be serialized or restored.
    #[error("corrupt resource: {0}")]
    CorruptResource(String),
    /// Backing storage failed; the cache instance must be rebuilt.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),
    /// A previous storage failure left the cache unusable.
    #[error("cache unusable after storage failure: {0}")]
    Failed(String),
}

impl CacheError {
    /// Build a [`CacheError::CorruptResource`] from any displayable error.
    pub fn corrupt(error: impl std::fmt::Display) -> Self {
        CacheError::CorruptResource(error.to_string())
    }

    /// Whether this error means the cache instance can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::StorageFailure(_) | CacheError::Failed(_))
    }
}
