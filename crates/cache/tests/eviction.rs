//! End-to-end eviction behaviour of the resource cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;
use outcore_cache::{Builder, CacheConfig, CacheError, CacheHandle, Evictable, Residency};
use outcore_storage::{BackingStoreConfig, Counter, InMemoryMetrics, StorageError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn resident_ids<T>(cache: &outcore_cache::LRUCache, handles: &[CacheHandle<T>]) -> Vec<usize> {
    handles
        .iter()
        .filter(|handle| cache.residency(**handle).unwrap() == Residency::Resident)
        .map(|handle| handle.id().index())
        .collect()
}

#[test]
fn test_within_budget_never_evicts() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut builder = Builder::with_metrics(metrics.clone());
    let handles = [
        builder.register(vec![1u8; 100]),
        builder.register(vec![2u8; 200]),
        builder.register(vec![3u8; 50]),
    ];
    let cache = builder.build(1000).unwrap();

    for (expected, handle) in [1u8, 2, 3].iter().zip(handles) {
        let guard = cache.get(handle).unwrap();
        assert!(guard.iter().all(|byte| byte == expected));
    }

    assert_eq!(cache.memory_usage(), 350);
    assert_eq!(resident_ids(&cache, &handles), vec![0, 1, 2]);
    assert_eq!(metrics.counter(Counter::Evictions), 0);
    assert_eq!(cache.store().chunk_count(), 0);
}

#[test]
fn test_sequential_access_keeps_most_recent() {
    let mut builder = Builder::new();
    let handles: Vec<_> = (0..400u32).map(|i| builder.register(vec![(i % 251) as u8])).collect();
    let cache = builder
        .build_with_store_config(128, BackingStoreConfig::default().with_chunk_size(4096))
        .unwrap();

    for (i, handle) in handles.iter().enumerate() {
        let guard = cache.get(*handle).unwrap();
        assert_eq!(guard[0], (i % 251) as u8);
        drop(guard);
        assert!(cache.memory_usage() <= 128);
    }

    let resident = resident_ids(&cache, &handles);
    assert_eq!(resident, (272..400).collect::<Vec<_>>());
    assert_eq!(cache.memory_usage(), 128);
}

static RESTORES: AtomicUsize = AtomicUsize::new(0);

/// Blob that counts how often it is rebuilt from bytes.
struct CountedBlob(Vec<u8>);

impl Evictable for CountedBlob {
    fn size_bytes(&self) -> u64 {
        self.0.len() as u64
    }

    fn serialize(&self) -> Result<Bytes, CacheError> {
        Ok(Bytes::copy_from_slice(&self.0))
    }

    fn deserialize(bytes: Bytes) -> Result<Self, CacheError> {
        RESTORES.fetch_add(1, Ordering::SeqCst);
        Ok(CountedBlob(bytes.to_vec()))
    }
}

#[test]
fn test_concurrent_gets_restore_once() {
    let mut builder = Builder::new();
    let handle = builder.register(CountedBlob(vec![9; 256]));
    let cache = builder.build(4096).unwrap();
    assert!(cache.force_evict(handle).unwrap());

    let barrier = Barrier::new(2);
    let addresses: Vec<usize> = thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    let guard = cache.get(handle).unwrap();
                    assert_eq!(guard.0, vec![9; 256]);
                    let address = &*guard as *const CountedBlob as usize;
                    // Keep both guards alive at the same time.
                    barrier.wait();
                    address
                })
            })
            .collect();
        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    });

    assert_eq!(addresses[0], addresses[1]);
    assert_eq!(RESTORES.load(Ordering::SeqCst), 1);
    assert_eq!(cache.pin_count(handle).unwrap(), 0);
    assert_eq!(cache.residency(handle).unwrap(), Residency::Resident);
}

#[test]
fn test_storage_failure_makes_cache_unusable() {
    let mut builder = Builder::new();
    let first = builder.register(vec![1u8; 64]);
    let second = builder.register(vec![2u8; 64]);
    let store_config = BackingStoreConfig::default().with_chunk_size(1024).with_disk_quota(0);
    let cache = builder.build_with_store_config(64, store_config).unwrap();

    let result = cache.get(second);
    assert!(matches!(
        result,
        Err(CacheError::StorageFailure(StorageError::QuotaExceeded { .. }))
    ));
    assert!(cache.is_failed());

    // The victim was never marked evicted.
    assert_eq!(cache.residency(first).unwrap(), Residency::Resident);
    assert_eq!(cache.pin_count(second).unwrap(), 0);

    assert!(matches!(cache.get(first), Err(CacheError::Failed(_))));
    assert!(matches!(cache.force_evict(first), Err(CacheError::Failed(_))));
}

#[test]
fn test_pinned_resources_are_never_evicted() {
    let mut builder = Builder::new();
    let handles: Vec<_> = (0..8u8).map(|i| builder.register(vec![i; 32])).collect();
    let cache = builder.build(64).unwrap();

    let held: Vec<_> = handles[..4].iter().map(|handle| cache.get(*handle).unwrap()).collect();
    for handle in &handles[4..] {
        drop(cache.get(*handle).unwrap());
    }

    for handle in &handles[..4] {
        assert_eq!(cache.residency(*handle).unwrap(), Residency::Resident);
        assert_eq!(cache.pin_count(*handle).unwrap(), 1);
    }
    assert_eq!(cache.memory_usage(), 4 * 32 + 32);
    assert!(cache.stats().budget_overruns > 0);

    drop(held);
    drop(cache.get(handles[7]).unwrap());
    assert!(cache.memory_usage() <= 64);
}

#[test]
fn test_shuffled_access_returns_original_contents() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut builder = Builder::with_metrics(metrics.clone());
    let originals: Vec<String> = (0..64).map(|i| format!("resource-{i:03}-{}", "x".repeat(i))).collect();
    let handles: Vec<_> = originals.iter().map(|s| builder.register(s.clone())).collect();
    let cache = builder
        .build_with_store_config(512, BackingStoreConfig::default().with_chunk_size(1024))
        .unwrap();

    let mut order: Vec<usize> = (0..handles.len()).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..5 {
        order.shuffle(&mut rng);
        for &index in &order {
            let guard = cache.get(handles[index]).unwrap();
            assert_eq!(*guard, originals[index]);
        }
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.promotions > 0);
    assert_eq!(metrics.counter(Counter::Evictions), stats.evictions);
    assert_eq!(metrics.counter(Counter::Promotions), stats.promotions);
    assert_eq!(metrics.counter(Counter::DiskBytesWritten), cache.store().bytes_written());
    assert!(cache.store().chunk_count() > 1);
}

#[test]
fn test_config_directory_holds_spill_files() {
    let scratch = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(16).with_chunk_size(256).with_backing_dir(scratch.path());

    let mut builder = Builder::new();
    let a = builder.register(vec![0u8; 16]);
    let b = builder.register(vec![1u8; 16]);
    let cache = builder.build_with_config(&config).unwrap();

    drop(cache.get(b).unwrap());
    assert_eq!(cache.residency(a).unwrap(), Residency::Evicted);

    let spill_dir = cache.store().directory().to_path_buf();
    assert!(spill_dir.starts_with(scratch.path()));
    assert_eq!(std::fs::read_dir(&spill_dir).unwrap().count(), 1);

    drop(cache);
    assert!(!spill_dir.exists());
}

#[test]
fn test_repeated_eviction_stays_within_quota() {
    let mut builder = Builder::new();
    let a = builder.register(vec![1u8; 64]);
    let b = builder.register(vec![2u8; 64]);
    let store_config = BackingStoreConfig::default().with_chunk_size(128).with_disk_quota(1024);
    let cache = builder.build_with_store_config(64, store_config).unwrap();

    for round in 0..200 {
        let (handle, fill) = if round % 2 == 0 { (a, 1u8) } else { (b, 2u8) };
        let guard = cache.get(handle).unwrap();
        assert!(guard.iter().all(|byte| *byte == fill));
    }

    let stats = cache.stats();
    assert!(stats.evictions >= 199);
    assert_eq!(stats.disk_bytes_written, 128);
    assert!(!cache.is_failed());
    assert!(cache.residency_is_consistent());
}

#[test]
fn test_registered_evicted_data_larger_than_budget() {
    let mut builder = Builder::new();
    let handles: Vec<_> = (0..100u8)
        .map(|i| builder.register_evicted(vec![i; 32]).unwrap())
        .collect();
    let cache = builder
        .build_with_store_config(256, BackingStoreConfig::default().with_chunk_size(1024))
        .unwrap();

    assert_eq!(cache.memory_usage(), 0);
    assert_eq!(cache.stats().evicted_count, 100);

    for (i, handle) in handles.iter().enumerate() {
        let guard = cache.get(*handle).unwrap();
        assert_eq!(*guard, vec![i as u8; 32]);
    }

    assert!(cache.memory_usage() <= 256);
    assert_eq!(cache.stats().resident_count, 8);
    assert_eq!(cache.store().bytes_written(), 100 * 32);
    assert!(cache.residency_is_consistent());
}
