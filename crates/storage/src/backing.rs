//! Memory-mapped, append-only backing storage.
//!
//! Payloads are packed into preallocated chunk files that live in a private
//! temporary directory. Reserving an offset range is the only step done under
//! a lock; the copy into the mapped range happens afterwards, so concurrent
//! writers only contend on the cursor.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;

use crate::metrics::{Counter, MetricsSink, NoopMetrics};
use crate::StorageError;

/// Default size of a chunk file (64 MB).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration for a [`BackingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStoreConfig {
    /// Size of each preallocated chunk file in bytes
    pub chunk_size: u64,
    /// Parent directory for the spill directory (OS temp dir when unset)
    pub directory: Option<PathBuf>,
    /// Maximum number of chunk bytes the store may allocate
    pub disk_quota: Option<u64>,
}

impl Default for BackingStoreConfig {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, directory: None, disk_quota: None }
    }
}

impl BackingStoreConfig {
    /// Set the chunk size in bytes.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Set the parent directory for chunk files.
    pub fn with_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.directory = Some(path.as_ref().to_path_buf());
        self
    }

    /// Limit the total bytes of chunk files.
    pub fn with_disk_quota(mut self, bytes: u64) -> Self {
        self.disk_quota = Some(bytes);
        self
    }
}

/// Location of an appended payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    /// Index of the chunk holding the payload
    pub chunk: u32,
    /// Byte offset inside the chunk
    pub offset: u64,
    /// Payload length in bytes
    pub len: u64,
}

impl Span {
    /// Span of a zero-length payload.
    pub const EMPTY: Span = Span { chunk: 0, offset: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Chunk {
    path: PathBuf,
    map: MmapRaw,
    capacity: u64,
}

#[derive(Default)]
struct Cursor {
    /// Chunk that small payloads are currently packed into
    current: Option<u32>,
    /// Next free offset inside `current`
    offset: u64,
    /// Bytes of chunk files allocated so far
    allocated: u64,
}

/// Append-only byte storage backed by memory-mapped chunk files.
///
/// Thread-safe: `append` and `read` may be called from any number of threads.
/// Chunk files are removed when the store is dropped.
pub struct BackingStore {
    config: BackingStoreConfig,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    cursor: Mutex<Cursor>,
    bytes_written: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
    // Dropped last so every mapping is gone before the directory is removed.
    dir: TempDir,
}

impl BackingStore {
    /// Open a store that reports to no metrics sink.
    pub fn open(config: BackingStoreConfig) -> Result<Self, StorageError> {
        Self::open_with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Open a store, creating its private spill directory.
    pub fn open_with_metrics(
        config: BackingStoreConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, StorageError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("outcore-spill-");

        let dir = match &config.directory {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(StorageError::Directory)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(StorageError::Directory)?;

        tracing::info!(
            directory = %dir.path().display(),
            chunk_size = config.chunk_size,
            "opened backing store"
        );

        Ok(Self {
            config,
            chunks: RwLock::new(Vec::new()),
            cursor: Mutex::new(Cursor::default()),
            bytes_written: AtomicU64::new(0),
            metrics,
            dir,
        })
    }

    /// Copy `bytes` into the store and return where they live.
    pub fn append(&self, bytes: &[u8]) -> Result<Span, StorageError> {
        if bytes.is_empty() {
            return Ok(Span::EMPTY);
        }

        let len = bytes.len() as u64;
        let (chunk, span) = self.reserve(len)?;

        // SAFETY: `reserve` handed out `span.offset..span.offset + len` inside
        // this chunk's mapping to this call only; ranges are never reused.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                chunk.map.as_mut_ptr().add(span.offset as usize),
                bytes.len(),
            );
        }

        self.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.metrics.increment(Counter::DiskBytesWritten, len);
        Ok(span)
    }

    /// Copy the payload at `span` out of the store.
    ///
    /// `span` must have been returned by [`append`](Self::append) on this store.
    pub fn read(&self, span: Span) -> Result<Bytes, StorageError> {
        if span.is_empty() {
            return Ok(Bytes::new());
        }

        let chunk = self
            .chunks
            .read()
            .get(span.chunk as usize)
            .cloned()
            .ok_or(StorageError::InvalidSpan(span))?;

        let in_bounds = span.offset.checked_add(span.len).is_some_and(|end| end <= chunk.capacity);
        if !in_bounds {
            return Err(StorageError::InvalidSpan(span));
        }

        // SAFETY: the range lies inside the mapping, which stays alive through
        // the `Arc`. The file was sized with `set_len` so every byte is
        // initialized, and appended ranges are never written again.
        let data = unsafe {
            slice::from_raw_parts(chunk.map.as_ptr().add(span.offset as usize), span.len as usize)
        };
        let bytes = Bytes::copy_from_slice(data);

        self.metrics.increment(Counter::DiskBytesRead, span.len);
        Ok(bytes)
    }

    /// Total payload bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Number of chunk files created.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Directory holding the chunk files.
    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &BackingStoreConfig {
        &self.config
    }

    /// Reserve `len` bytes, allocating a chunk when the current one is full.
    fn reserve(&self, len: u64) -> Result<(Arc<Chunk>, Span), StorageError> {
        let mut cursor = self.cursor.lock();

        if let Some(index) = cursor.current {
            let chunk = self.chunks.read()[index as usize].clone();
            if cursor.offset + len <= chunk.capacity {
                let span = Span { chunk: index, offset: cursor.offset, len };
                cursor.offset += len;
                return Ok((chunk, span));
            }
        }

        if len > self.config.chunk_size {
            // Oversized payloads get a chunk of their own; the packing chunk
            // stays current for the next small payload.
            let (index, chunk) = self.allocate_chunk(len, &mut cursor)?;
            return Ok((chunk, Span { chunk: index, offset: 0, len }));
        }

        let (index, chunk) = self.allocate_chunk(self.config.chunk_size, &mut cursor)?;
        cursor.current = Some(index);
        cursor.offset = len;
        Ok((chunk, Span { chunk: index, offset: 0, len }))
    }

    fn allocate_chunk(
        &self,
        capacity: u64,
        cursor: &mut Cursor,
    ) -> Result<(u32, Arc<Chunk>), StorageError> {
        if let Some(quota) = self.config.disk_quota {
            if cursor.allocated.saturating_add(capacity) > quota {
                tracing::error!(quota, requested = capacity, "backing store quota exceeded");
                return Err(StorageError::QuotaExceeded { quota, requested: capacity });
            }
        }

        let mut chunks = self.chunks.write();
        let index = chunks.len() as u32;
        let path = self.dir.path().join(format!("chunk-{index:06}.bin"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StorageError::CreateChunk { path: path.clone(), source })?;
        file.set_len(capacity)
            .map_err(|source| StorageError::CreateChunk { path: path.clone(), source })?;

        let map = MmapOptions::new()
            .len(capacity as usize)
            .map_raw(&file)
            .map_err(|source| StorageError::MapChunk { path: path.clone(), source })?;

        tracing::debug!(chunk = index, capacity, path = %path.display(), "allocated chunk");

        let chunk = Arc::new(Chunk { path, map, capacity });
        chunks.push(chunk.clone());
        cursor.allocated += capacity;
        self.metrics.increment(Counter::ChunksAllocated, 1);

        Ok((index, chunk))
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        let chunks = self.chunks.get_mut();
        tracing::info!(
            directory = %self.dir.path().display(),
            chunks = chunks.len(),
            bytes_written = self.bytes_written.load(Ordering::Relaxed),
            "releasing backing store"
        );
        for chunk in chunks.iter() {
            tracing::trace!(path = %chunk.path.display(), "unmapping chunk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Counter, InMemoryMetrics};
    use std::thread;

    fn small_store(chunk_size: u64) -> BackingStore {
        BackingStore::open(BackingStoreConfig::default().with_chunk_size(chunk_size))
            .expect("store should open")
    }

    #[test]
    fn test_append_and_read() {
        let store = small_store(1024);

        let first = store.append(b"hello").unwrap();
        let second = store.append(b"world!").unwrap();

        assert_eq!(first, Span { chunk: 0, offset: 0, len: 5 });
        assert_eq!(second, Span { chunk: 0, offset: 5, len: 6 });
        assert_eq!(&store.read(first).unwrap()[..], b"hello");
        assert_eq!(&store.read(second).unwrap()[..], b"world!");
        assert_eq!(store.bytes_written(), 11);
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn test_empty_append_touches_nothing() {
        let store = small_store(1024);

        let span = store.append(&[]).unwrap();

        assert!(span.is_empty());
        assert!(store.read(span).unwrap().is_empty());
        assert_eq!(store.chunk_count(), 0);
    }

    #[test]
    fn test_rollover_to_new_chunk() {
        let store = small_store(16);

        let first = store.append(&[1u8; 10]).unwrap();
        let second = store.append(&[2u8; 10]).unwrap();

        assert_eq!(first.chunk, 0);
        assert_eq!(second.chunk, 1);
        assert_eq!(second.offset, 0);
        assert_eq!(store.chunk_count(), 2);
        assert_eq!(&store.read(first).unwrap()[..], &[1u8; 10]);
        assert_eq!(&store.read(second).unwrap()[..], &[2u8; 10]);
    }

    #[test]
    fn test_oversized_payload_gets_dedicated_chunk() {
        let store = small_store(16);

        let small = store.append(&[1u8; 4]).unwrap();
        let large = store.append(&[7u8; 40]).unwrap();
        let after = store.append(&[3u8; 4]).unwrap();

        assert_eq!(small, Span { chunk: 0, offset: 0, len: 4 });
        assert_eq!(large, Span { chunk: 1, offset: 0, len: 40 });
        // Packing continues in the first chunk.
        assert_eq!(after, Span { chunk: 0, offset: 4, len: 4 });
        assert_eq!(&store.read(large).unwrap()[..], &[7u8; 40][..]);
    }

    #[test]
    fn test_quota_exceeded() {
        let config = BackingStoreConfig::default().with_chunk_size(32).with_disk_quota(32);
        let store = BackingStore::open(config).unwrap();

        store.append(&[0u8; 20]).unwrap();
        let result = store.append(&[0u8; 20]);

        assert!(matches!(result, Err(StorageError::QuotaExceeded { quota: 32, requested: 32 })));
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn test_invalid_span() {
        let store = small_store(16);
        store.append(&[0u8; 8]).unwrap();

        let missing_chunk = Span { chunk: 5, offset: 0, len: 1 };
        let past_end = Span { chunk: 0, offset: 10, len: 10 };

        assert!(matches!(store.read(missing_chunk), Err(StorageError::InvalidSpan(_))));
        assert!(matches!(store.read(past_end), Err(StorageError::InvalidSpan(_))));
    }

    #[test]
    fn test_concurrent_appends() {
        let store = Arc::new(small_store(4096));

        let handles: Vec<_> = (0..8u8)
            .map(|worker| {
                let store = store.clone();
                thread::spawn(move || {
                    (0..200u32)
                        .map(|i| {
                            let payload = vec![worker; (i % 50 + 1) as usize];
                            (store.append(&payload).unwrap(), payload)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            for (span, payload) in handle.join().unwrap() {
                assert_eq!(&store.read(span).unwrap()[..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let store =
            BackingStore::open(BackingStoreConfig::default().with_directory(parent.path()))
                .unwrap();
        store.append(b"payload").unwrap();

        let dir = store.directory().to_path_buf();
        assert!(dir.starts_with(parent.path()));
        assert!(dir.join("chunk-000000.bin").exists());

        drop(store);
        assert!(!dir.exists());
    }

    #[test]
    fn test_metrics_reported() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = BackingStore::open_with_metrics(
            BackingStoreConfig::default().with_chunk_size(64),
            metrics.clone(),
        )
        .unwrap();

        let span = store.append(&[9u8; 48]).unwrap();
        store.read(span).unwrap();

        assert_eq!(metrics.counter(Counter::DiskBytesWritten), 48);
        assert_eq!(metrics.counter(Counter::DiskBytesRead), 48);
        assert_eq!(metrics.counter(Counter::ChunksAllocated), 1);
    }
}
