//! The capability every cached resource type implements.

use bytes::Bytes;

use crate::CacheError;

/// A resource whose in-memory form can be dropped and rebuilt from bytes.
///
/// `deserialize(serialize(x))` must be observationally equal to `x`, and
/// neither call may touch state outside the value. Failures are reported as
/// [`CacheError::CorruptResource`]; a partially rebuilt value is never
/// returned.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use outcore_cache::{CacheError, Evictable};
///
/// struct Triangle {
///     indices: [u32; 3],
/// }
///
/// impl Evictable for Triangle {
///     fn size_bytes(&self) -> u64 {
///         std::mem::size_of::<Self>() as u64
///     }
///
///     fn serialize(&self) -> Result<Bytes, CacheError> {
///         let bytes: Vec<u8> = self.indices.iter().flat_map(|i| i.to_le_bytes()).collect();
///         Ok(Bytes::from(bytes))
///     }
///
///     fn deserialize(bytes: Bytes) -> Result<Self, CacheError> {
///         if bytes.len() != 12 {
///             return Err(CacheError::corrupt("expected 12 bytes"));
///         }
///         let mut indices = [0u32; 3];
///         for (slot, chunk) in indices.iter_mut().zip(bytes.chunks_exact(4)) {
///             *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
///         }
///         Ok(Triangle { indices })
///     }
/// }
/// ```
pub trait Evictable: Send + Sync + Sized + 'static {
    /// Current in-memory footprint, used for budget accounting.
    fn size_bytes(&self) -> u64;

    /// Produce a self-contained byte representation.
    fn serialize(&self) -> Result<Bytes, CacheError>;

    /// Rebuild a value from bytes produced by [`serialize`](Self::serialize).
    fn deserialize(bytes: Bytes) -> Result<Self, CacheError>;
}

impl Evictable for Vec<u8> {
    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }

    fn serialize(&self) -> Result<Bytes, CacheError> {
        Ok(Bytes::copy_from_slice(self))
    }

    fn deserialize(bytes: Bytes) -> Result<Self, CacheError> {
        Ok(bytes.to_vec())
    }
}

impl Evictable for String {
    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }

    fn serialize(&self) -> Result<Bytes, CacheError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn deserialize(bytes: Bytes) -> Result<Self, CacheError> {
        String::from_utf8(bytes.to_vec()).map_err(CacheError::corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_round_trip() {
        let value = vec![0u8, 1, 2, 254, 255];
        let restored = Vec::<u8>::deserialize(value.serialize().unwrap()).unwrap();
        assert_eq!(restored, value);
        assert_eq!(restored.size_bytes(), 5);
    }

    #[test]
    fn test_string_round_trip() {
        let value = String::from("bvh node ✓");
        let restored = String::deserialize(value.serialize().unwrap()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let result = String::deserialize(Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(result, Err(CacheError::CorruptResource(_))));
    }
}
