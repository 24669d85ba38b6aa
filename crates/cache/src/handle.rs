//! Typed handles into the resource table.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Stable identifier of a registered resource.
///
/// Assigned in registration order and never reused by the cache that
/// assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

impl ResourceId {
    /// Position of the resource in registration order.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Copyable reference to a resource of type `T`.
///
/// Carries no ownership; it stays valid for the lifetime of the cache built
/// from the [`Builder`](crate::Builder) that created it.
pub struct CacheHandle<T> {
    pub(crate) cache_id: u64,
    pub(crate) id: ResourceId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CacheHandle<T> {
    pub(crate) fn new(cache_id: u64, id: ResourceId) -> Self {
        Self { cache_id, id, _marker: PhantomData }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

// Manual impls: the derives would require `T: Clone` etc.
impl<T> Clone for CacheHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CacheHandle<T> {}

impl<T> PartialEq for CacheHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cache_id == other.cache_id && self.id == other.id
    }
}

impl<T> Eq for CacheHandle<T> {}

impl<T> Hash for CacheHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cache_id.hash(state);
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for CacheHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("cache", &self.cache_id)
            .field("id", &self.id)
            .finish()
    }
}
