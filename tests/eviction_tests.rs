//! Integration tests for L1 capacity accounting and LRU eviction.

use std::sync::Arc;

use kv_tier::cache::block::{BlockReference, CacheKey};
use kv_tier::cache::l1::L1Cache;
use kv_tier::status::StatusCode;
use kv_tier::transfer::device::{DeviceMemory, HostPool};
use kv_tier::transfer::handler::{HostTransferHandler, TransferHandler};

fn l1(capacity: u64) -> (L1Cache, Arc<DeviceMemory>) {
    let devices = Arc::new(DeviceMemory::new(1, 64 * 1024));
    let transfer: Arc<dyn TransferHandler> = Arc::new(HostTransferHandler::new(
        devices.clone(),
        Arc::new(HostPool::new(capacity as usize)),
    ));
    (L1Cache::new(capacity, transfer), devices)
}

fn block(slot: u64, size: u64) -> BlockReference {
    BlockReference::new(0, slot * 1024, size)
}

#[tokio::test]
async fn test_capacity_for_k_blocks_evicts_least_recent() {
    let (cache, _) = l1(300);
    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        assert!(cache.put(&CacheKey::from(*key), &block(i as u64, 100)).await.success);
    }

    // Touch "a" so "b" becomes least recent.
    assert!(cache.get(&CacheKey::from("a"), &block(10, 100)).await.success);
    assert!(cache.put(&CacheKey::from("d"), &block(3, 100)).await.success);

    assert!(cache.contains(&CacheKey::from("a")).await);
    assert!(!cache.contains(&CacheKey::from("b")).await);
    assert!(cache.contains(&CacheKey::from("c")).await);
    assert!(cache.contains(&CacheKey::from("d")).await);

    let stats = cache.stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.resident_blocks, 3);
}

#[tokio::test]
async fn test_used_bytes_tracks_resident_sizes() {
    let (cache, _) = l1(1000);
    // Mixed sizes with replacements, evictions and explicit removals.
    let sizes = [120u64, 300, 80, 450, 200, 64, 333, 90, 500, 10, 256, 128];
    for (i, size) in sizes.iter().enumerate() {
        let key = CacheKey::new(format!("k{}", i % 7));
        let status = cache.put(&key, &block(i as u64, *size)).await;
        assert!(status.success, "{}", status.message);

        if i % 5 == 4 {
            cache.evict(&CacheKey::new(format!("k{}", (i + 3) % 7))).await;
        }

        let stats = cache.stats().await;
        assert_eq!(stats.used_bytes, stats.resident_bytes);
        assert!(stats.used_bytes <= stats.capacity_bytes);
        assert_eq!(stats.tracked_keys, stats.resident_blocks);
    }
}

#[tokio::test]
async fn test_block_larger_than_pool_is_rejected_without_eviction() {
    let (cache, _) = l1(100);
    assert!(cache.put(&CacheKey::from("a"), &block(0, 60)).await.success);

    let status = cache.put(&CacheKey::from("huge"), &block(1, 101)).await;
    assert_eq!(status.code, StatusCode::CapacityExhausted);
    assert!(cache.contains(&CacheKey::from("a")).await);
}

#[tokio::test]
async fn test_concurrent_puts_keep_accounting_consistent() {
    let (cache, _) = l1(100);
    let cache = Arc::new(cache);

    let puts = (0..32u64).map(|i| {
        let cache = cache.clone();
        async move {
            let key = CacheKey::new(format!("k{}", i % 12));
            cache.put(&key, &block(i, 10 + (i % 3) * 5)).await
        }
    });
    let results = futures::future::join_all(puts).await;
    assert!(results.iter().all(|s| s.success));

    let stats = cache.stats().await;
    assert_eq!(stats.used_bytes, stats.resident_bytes);
    assert!(stats.used_bytes <= 100);
    assert_eq!(stats.tracked_keys, stats.resident_blocks);
}

#[tokio::test]
async fn test_fetched_bytes_match_offloaded_bytes() {
    let (cache, devices) = l1(4096);
    let src = block(0, 256);
    let payload: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
    devices.write(&src, &payload).unwrap();

    assert!(cache.put(&CacheKey::from("p"), &src).await.success);
    // Clobber the source so the fetch must come from L1.
    devices.write(&src, &[0u8; 256]).unwrap();

    let dst = block(5, 256);
    assert!(cache.get(&CacheKey::from("p"), &dst).await.success);
    assert_eq!(devices.read(&dst).unwrap().as_ref(), payload.as_slice());
}
