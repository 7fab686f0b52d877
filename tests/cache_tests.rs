//! Integration tests for the tiered cache manager over an in-memory fleet.

use std::sync::Arc;
use std::time::Duration;

use kv_tier::cache::block::{BlockReference, CacheKey};
use kv_tier::cache::codec::BlockCodec;
use kv_tier::cache::l1::L1Cache;
use kv_tier::cache::manager::{TieredCacheManager, TieringPolicy};
use kv_tier::cluster::connector::L2Connector;
use kv_tier::cluster::controller::Controller;
use kv_tier::cluster::node::StorageNode;
use kv_tier::cluster::transport::InMemoryTransport;
use kv_tier::status::StatusCode;
use kv_tier::transfer::device::{DeviceMemory, HostPool};
use kv_tier::transfer::handler::{HostTransferHandler, TransferHandler};

struct Harness {
    manager: TieredCacheManager,
    devices: Arc<DeviceMemory>,
    transport: Arc<InMemoryTransport>,
}

async fn harness(policy: TieringPolicy, l1_capacity: u64, nodes: &[&str]) -> Harness {
    let devices = Arc::new(DeviceMemory::new(1, 16 * 1024));
    let transfer: Arc<dyn TransferHandler> = Arc::new(HostTransferHandler::new(
        devices.clone(),
        Arc::new(HostPool::new(l1_capacity as usize)),
    ));
    let controller = Arc::new(Controller::with_seed_nodes(
        Duration::from_secs(10),
        nodes
            .iter()
            .enumerate()
            .map(|(i, id)| StorageNode::new(*id, format!("10.1.1.{}", 10 + i), 6379))
            .collect(),
    ));
    let transport = Arc::new(InMemoryTransport::new());
    let l2 = Arc::new(
        L2Connector::new(3, transport.clone(), controller).with_codec(BlockCodec::new(true, 3)),
    );
    l2.initialize().await;

    let l1 = Arc::new(L1Cache::new(l1_capacity, transfer.clone()));
    Harness {
        manager: TieredCacheManager::new(l1, l2, transfer, policy),
        devices,
        transport,
    }
}

impl Harness {
    /// Write `fill` into a device block at `addr` and offload it under `key`.
    async fn offload(&self, key: &str, addr: u64, size: u64, fill: u8) -> kv_tier::status::Status {
        let block = BlockReference::new(0, addr, size);
        self.devices.write(&block, &vec![fill; size as usize]).unwrap();
        self.manager.offload(&CacheKey::from(key), &block, None).await
    }

    async fn fetch(&self, key: &str, addr: u64, size: u64) -> (kv_tier::status::Status, Vec<u8>) {
        let dest = BlockReference::new(0, addr, size);
        let status = self.manager.fetch(&CacheKey::from(key), &dest, None).await;
        let bytes = self.devices.read(&dest).unwrap().to_vec();
        (status, bytes)
    }
}

#[tokio::test]
async fn test_exclusive_tiering_loses_evicted_block() {
    let h = harness(TieringPolicy::Exclusive, 100, &["redis-0", "redis-1", "redis-2"]).await;

    assert_eq!(h.offload("a", 0, 60, 0xA).await.message, "stored in L1");
    // 60 + 60 > 100: "a" is evicted to make room for "b".
    assert_eq!(h.offload("b", 1024, 60, 0xB).await.message, "stored in L1");
    assert!(!h.manager.l1().contains(&CacheKey::from("a")).await);
    assert_eq!(h.transport.total_blocks(), 0);

    let (status, _) = h.fetch("a", 4096, 60).await;
    assert!(status.is_miss());
    assert_eq!(status.message, "cache miss");

    let (status, bytes) = h.fetch("b", 4096, 60).await;
    assert_eq!(status.message, "hit in L1");
    assert_eq!(bytes, vec![0xB; 60]);
}

#[tokio::test]
async fn test_write_through_serves_evicted_block_from_l2() {
    let h = harness(TieringPolicy::WriteThrough, 100, &["redis-0", "redis-1", "redis-2"]).await;

    assert_eq!(h.offload("a", 0, 60, 0xA).await.message, "stored in L1 and L2");
    assert_eq!(h.offload("b", 1024, 60, 0xB).await.message, "stored in L1 and L2");
    assert!(!h.manager.l1().contains(&CacheKey::from("a")).await);
    assert_eq!(h.transport.total_blocks(), 2);

    let (status, bytes) = h.fetch("a", 4096, 60).await;
    assert!(status.success);
    assert_eq!(status.message, "hit in L2 (promoted to L1)");
    assert_eq!(bytes, vec![0xA; 60]);

    // Promotion made "a" resident again, at the expense of "b".
    assert!(h.manager.l1().contains(&CacheKey::from("a")).await);
    let (status, _) = h.fetch("a", 8192, 60).await;
    assert_eq!(status.message, "hit in L1");
}

#[tokio::test]
async fn test_round_trip_from_either_tier() {
    let h = harness(TieringPolicy::Exclusive, 128, &["redis-0", "redis-1"]).await;

    assert!(h.offload("small", 0, 100, 1).await.success);
    let (status, bytes) = h.fetch("small", 2048, 100).await;
    assert_eq!(status.message, "hit in L1");
    assert_eq!(bytes, vec![1; 100]);

    // Too large for L1 at all, so it lands in L2.
    let status = h.offload("large", 4096, 1000, 2).await;
    assert!(status.message.starts_with("promoted to L2"), "{}", status.message);
    let (status, bytes) = h.fetch("large", 8192, 1000).await;
    assert_eq!(status.message, "hit in L2");
    assert_eq!(bytes, vec![2; 1000]);
}

#[tokio::test]
async fn test_miss_is_distinct_from_unreachable_l2() {
    let h = harness(TieringPolicy::Exclusive, 64, &["redis-0"]).await;
    let (miss, _) = h.fetch("never", 0, 32).await;
    assert_eq!(miss.code, StatusCode::NotFound);

    h.transport.set_reachable("redis-0", false);
    let (down, _) = h.fetch("never", 0, 32).await;
    assert_eq!(down.code, StatusCode::Unavailable);
    assert!(!down.is_miss());
    assert!(down.code.is_retryable());

    // Offload falls back to L2, which is down: a failure, not a panic.
    let status = h.offload("big", 0, 128, 7).await;
    assert!(!status.success);
    assert_eq!(status.code, StatusCode::Unavailable);
}

#[tokio::test]
async fn test_empty_fleet_routes_nothing() {
    let h = harness(TieringPolicy::Exclusive, 64, &[]).await;
    let status = h.offload("big", 0, 128, 7).await;
    assert_eq!(status.code, StatusCode::Unavailable);
    assert!(status.message.contains("No storage nodes available."));
}

#[tokio::test]
async fn test_global_availability() {
    let h = harness(TieringPolicy::Exclusive, 64, &["redis-0", "redis-1"]).await;
    assert!(h.offload("in-l1", 0, 32, 1).await.success);
    assert!(h.offload("in-l2", 1024, 256, 2).await.success);

    assert!(h.manager.check_global_availability(&CacheKey::from("in-l1")).await);
    assert!(h.manager.check_global_availability(&CacheKey::from("in-l2")).await);
    assert!(!h.manager.check_global_availability(&CacheKey::from("absent")).await);
}

#[tokio::test]
async fn test_stats_reflect_tier_traffic() {
    let h = harness(TieringPolicy::Exclusive, 64, &["redis-0"]).await;
    h.offload("a", 0, 32, 1).await;
    h.offload("b", 1024, 256, 2).await;
    h.fetch("a", 4096, 32).await;
    h.fetch("b", 8192, 256).await;
    h.fetch("c", 8192, 256).await;

    let stats = h.manager.stats().await;
    assert_eq!(stats.offloads_l1, 1);
    assert_eq!(stats.offloads_l2, 1);
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.l2_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.l2.ring_nodes, 1);
    assert!(stats.transfer.total_d2h_bytes >= 32);
}
