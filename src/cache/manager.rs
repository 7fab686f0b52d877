//! Multi-tiered cache manager: the only place tiering policy lives.
//!
//! Offload tries L1 first and falls back to L2 when L1 cannot take the
//! block. Fetch tries L1, then L2, restoring L2 hits into device memory and
//! promoting them into L1. A miss in both tiers is a normal outcome
//! (`StatusCode::NotFound`) and is kept distinct from an unreachable L2
//! (`StatusCode::Unavailable`).
//!
//! Under [`TieringPolicy::Exclusive`] a block offloaded to L1 lives only in
//! L1, and an L1 eviction drops it. [`TieringPolicy::WriteThrough`] also
//! mirrors every L1 offload into L2, so a later fetch still hits after the
//! L1 copy is evicted.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockReference, CacheKey};
use crate::cache::l1::{L1Cache, L1Stats};
use crate::cluster::connector::{ConnectorStats, L2Connector};
use crate::status::{Status, StatusCode};
use crate::transfer::handler::{TransferHandler, TransferStatsSnapshot};

/// Whether an L1 offload is mirrored into L2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieringPolicy {
    /// L2 only receives blocks L1 rejected.
    #[default]
    Exclusive,
    /// Every block stored in L1 is also written to L2.
    WriteThrough,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    offloads_l1: AtomicU64,
    offloads_l2: AtomicU64,
    offload_failures: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub policy: TieringPolicy,
    pub offloads_l1: u64,
    pub offloads_l2: u64,
    pub offload_failures: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub l1: L1Stats,
    pub l2: ConnectorStats,
    pub transfer: TransferStatsSnapshot,
}

/// Where the deadline-bound part of an offload left the block.
enum Offloaded {
    L1,
    Elsewhere(Status),
}

pub struct TieredCacheManager {
    l1: Arc<L1Cache>,
    l2: Arc<L2Connector>,
    transfer: Arc<dyn TransferHandler>,
    policy: TieringPolicy,
    default_timeout: Option<Duration>,
    counters: ManagerCounters,
}

impl TieredCacheManager {
    pub fn new(
        l1: Arc<L1Cache>,
        l2: Arc<L2Connector>,
        transfer: Arc<dyn TransferHandler>,
        policy: TieringPolicy,
    ) -> Self {
        info!(policy = ?policy, "Tiered cache manager initialized");
        Self {
            l1,
            l2,
            transfer,
            policy,
            default_timeout: None,
            counters: ManagerCounters::default(),
        }
    }

    /// Deadline applied when a call does not bring its own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn l1(&self) -> &Arc<L1Cache> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<L2Connector> {
        &self.l2
    }

    /// Store a device block, L1 first.
    ///
    /// If the deadline elapses mid-operation the in-flight work is dropped;
    /// an L1 reservation taken before that point is released on drop. The
    /// write-through mirror gets whatever is left of the deadline, and
    /// running out of it there does not fail a block already stored in L1.
    pub async fn offload(
        &self,
        key: &CacheKey,
        block: &BlockReference,
        timeout: Option<Duration>,
    ) -> Status {
        if let Some(status) = validate(key, block.size_bytes) {
            return status;
        }
        let limit = timeout.or(self.default_timeout);
        let started = Instant::now();
        let status = match self
            .with_deadline("offload", limit, self.offload_inner(key, block))
            .await
        {
            Ok(Offloaded::L1) if self.policy == TieringPolicy::WriteThrough => {
                let remaining = limit.map(|l| l.saturating_sub(started.elapsed()));
                self.mirror_to_l2(key, remaining).await
            }
            Ok(Offloaded::L1) => Status::ok("stored in L1"),
            Ok(Offloaded::Elsewhere(status)) | Err(status) => status,
        };
        if !status.success {
            self.counters.offload_failures.fetch_add(1, Ordering::Relaxed);
        }
        status
    }

    async fn offload_inner(&self, key: &CacheKey, block: &BlockReference) -> Offloaded {
        let l1_status = self.l1.put(key, block).await;
        if l1_status.success {
            self.counters.offloads_l1.fetch_add(1, Ordering::Relaxed);
            return Offloaded::L1;
        }
        Offloaded::Elsewhere(self.offload_to_l2(key, block, &l1_status).await)
    }

    async fn offload_to_l2(
        &self,
        key: &CacheKey,
        block: &BlockReference,
        l1_status: &Status,
    ) -> Status {
        debug!(key = %key, reason = %l1_status.message, "L1 rejected block, offloading to L2");
        let data = match self.transfer.read_device(block).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Device read for L2 offload failed");
                return Status::failure(
                    StatusCode::TransferFailed,
                    format!("device read failed: {e}"),
                );
            }
        };

        let l2_status = self.l2.put(key, &data).await;
        if l2_status.success {
            self.counters.offloads_l2.fetch_add(1, Ordering::Relaxed);
            l2_status.annotate("promoted to L2")
        } else {
            l2_status.annotate(&format!("L1 rejected ({}); L2 offload failed", l1_status.message))
        }
    }

    /// Write-through leg. The block is already safe in L1, so a mirror
    /// failure only degrades the message.
    async fn mirror_to_l2(&self, key: &CacheKey, remaining: Option<Duration>) -> Status {
        let mirror = async {
            let Some(data) = self.l1.read(key).await else {
                return Status::ok("stored in L1 (L2 mirror skipped: block already evicted)");
            };
            let l2_status = self.l2.put(key, &data).await;
            if l2_status.success {
                Status::ok("stored in L1 and L2")
            } else {
                warn!(key = %key, error = %l2_status.message, "Write-through to L2 failed");
                Status::ok(format!("stored in L1 (L2 mirror failed: {})", l2_status.message))
            }
        };
        match self.with_deadline("write-through", remaining, mirror).await {
            Ok(status) => status,
            Err(_) => Status::ok("stored in L1 (L2 mirror timed out)"),
        }
    }

    /// Restore a block into `dest`, L1 first, then L2 with promotion.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        dest: &BlockReference,
        timeout: Option<Duration>,
    ) -> Status {
        if let Some(status) = validate(key, dest.size_bytes) {
            return status;
        }
        self.with_deadline(
            "fetch",
            timeout.or(self.default_timeout),
            self.fetch_inner(key, dest),
        )
        .await
        .unwrap_or_else(|timed_out| timed_out)
    }

    async fn fetch_inner(&self, key: &CacheKey, dest: &BlockReference) -> Status {
        let l1_status = self.l1.get(key, dest).await;
        if l1_status.success {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Status::ok("hit in L1");
        }
        if !l1_status.is_miss() {
            warn!(key = %key, error = %l1_status.message, "L1 hit could not be restored, trying L2");
        }

        let l2_status = self.l2.get(key).await;
        if l2_status.is_miss() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Status::not_found("cache miss");
        }
        if !l2_status.success {
            return l2_status.annotate("L1 miss; L2 unavailable");
        }

        let data = l2_status.payload.unwrap_or_default();
        let size = data.len() as u64;
        if size > dest.size_bytes {
            return Status::failure(
                StatusCode::InvalidArgument,
                format!(
                    "destination holds {} bytes, block is {size} bytes",
                    dest.size_bytes
                ),
            );
        }
        if let Err(e) = self.transfer.write_device(dest, &data).await {
            warn!(key = %key, error = %e, "Restoring L2 block to device failed");
            return Status::failure(
                StatusCode::TransferFailed,
                format!("device write failed: {e}"),
            );
        }
        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);

        let promoted = self.l1.put(key, &dest.with_size(size)).await;
        if promoted.success {
            Status::ok("hit in L2 (promoted to L1)")
        } else {
            debug!(key = %key, reason = %promoted.message, "L1 promotion skipped");
            Status::ok("hit in L2")
        }
    }

    /// Cheap pre-flight: resident in L1, or present on the owning L2 node.
    pub async fn check_global_availability(&self, key: &CacheKey) -> bool {
        if self.l1.contains(key).await {
            return true;
        }
        self.l2.exists(key).await.success
    }

    /// Evict from L1 until `needed_bytes` are free.
    pub async fn request_l1_space(&self, needed_bytes: u64) -> Status {
        self.l1.make_room(needed_bytes).await
    }

    pub async fn stats(&self) -> ManagerStats {
        let c = &self.counters;
        ManagerStats {
            policy: self.policy,
            offloads_l1: c.offloads_l1.load(Ordering::Relaxed),
            offloads_l2: c.offloads_l2.load(Ordering::Relaxed),
            offload_failures: c.offload_failures.load(Ordering::Relaxed),
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            l1: self.l1.stats().await,
            l2: self.l2.stats(),
            transfer: self.transfer.stats(),
        }
    }

    /// Run `fut` under `limit`. On expiry the future is dropped and the
    /// error carries a `Timeout` status.
    async fn with_deadline<F, T>(&self, op: &str, limit: Option<Duration>, fut: F) -> Result<T, Status>
    where
        F: Future<Output = T>,
    {
        let Some(limit) = limit else {
            return Ok(fut.await);
        };
        tokio::time::timeout(limit, fut).await.map_err(|_| {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(op, timeout_ms = limit.as_millis() as u64, "Tier operation timed out");
            Status::failure(
                StatusCode::Timeout,
                format!("{op} timed out after {}ms", limit.as_millis()),
            )
        })
    }
}

fn validate(key: &CacheKey, size_bytes: u64) -> Option<Status> {
    if key.is_empty() {
        return Some(Status::failure(StatusCode::InvalidArgument, "empty cache key"));
    }
    if size_bytes == 0 {
        return Some(Status::failure(StatusCode::InvalidArgument, "zero-sized block"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::controller::Controller;
    use crate::cluster::node::StorageNode;
    use crate::cluster::transport::{InMemoryTransport, StorageTransport, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use crate::transfer::device::{DeviceMemory, HostPool};
    use crate::transfer::handler::HostTransferHandler;

    struct Rig {
        manager: TieredCacheManager,
        devices: Arc<DeviceMemory>,
        transport: Arc<InMemoryTransport>,
    }

    async fn rig(policy: TieringPolicy, l1_capacity: u64, latency: Duration) -> Rig {
        let devices = Arc::new(DeviceMemory::new(1, 4096));
        let pool = Arc::new(HostPool::new(l1_capacity as usize));
        let transfer: Arc<dyn TransferHandler> = Arc::new(
            HostTransferHandler::new(devices.clone(), pool).with_copy_latency(latency),
        );
        let transport = Arc::new(InMemoryTransport::new());
        let controller = Arc::new(Controller::with_seed_nodes(
            Duration::from_secs(10),
            vec![StorageNode::new("redis-0", "10.1.1.10", 6379)],
        ));
        let l2 = Arc::new(L2Connector::new(3, transport.clone(), controller));
        l2.initialize().await;
        let l1 = Arc::new(L1Cache::new(l1_capacity, transfer.clone()));
        Rig {
            manager: TieredCacheManager::new(l1, l2, transfer, policy),
            devices,
            transport,
        }
    }

    #[tokio::test]
    async fn test_rejected_block_goes_to_l2() {
        let r = rig(TieringPolicy::Exclusive, 100, Duration::ZERO).await;
        let big = BlockReference::new(0, 0, 200);
        r.devices.write(&big, &[3u8; 200]).unwrap();

        let status = r.manager.offload(&CacheKey::from("big"), &big, None).await;
        assert!(status.success);
        assert!(status.message.starts_with("promoted to L2"));
        assert_eq!(r.transport.total_blocks(), 1);

        let dest = BlockReference::new(0, 1024, 200);
        let fetched = r.manager.fetch(&CacheKey::from("big"), &dest, None).await;
        assert_eq!(fetched.message, "hit in L2");
        assert_eq!(r.devices.read(&dest).unwrap().as_ref(), &[3u8; 200][..]);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let r = rig(TieringPolicy::Exclusive, 100, Duration::ZERO).await;
        let status = r
            .manager
            .offload(&CacheKey::from(""), &BlockReference::new(0, 0, 10), None)
            .await;
        assert_eq!(status.code, StatusCode::InvalidArgument);

        let status = r
            .manager
            .fetch(&CacheKey::from("k"), &BlockReference::new(0, 0, 0), None)
            .await;
        assert_eq!(status.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_undersized_destination_for_l2_hit() {
        let r = rig(TieringPolicy::Exclusive, 10, Duration::ZERO).await;
        let block = BlockReference::new(0, 0, 64);
        r.devices.write(&block, &[1u8; 64]).unwrap();
        assert!(r.manager.offload(&CacheKey::from("k"), &block, None).await.success);

        let status = r
            .manager
            .fetch(&CacheKey::from("k"), &BlockReference::new(0, 512, 32), None)
            .await;
        assert_eq!(status.code, StatusCode::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_l1_reservation() {
        let r = rig(TieringPolicy::Exclusive, 100, Duration::from_millis(500)).await;
        let block = BlockReference::new(0, 0, 40);

        let status = r
            .manager
            .offload(&CacheKey::from("slow"), &block, Some(Duration::from_millis(100)))
            .await;
        assert_eq!(status.code, StatusCode::Timeout);

        let l1 = r.manager.l1().stats().await;
        assert_eq!(l1.used_bytes, 0);
        assert_eq!(l1.resident_blocks, 0);
        assert_eq!(r.manager.stats().await.timeouts, 1);
    }

    /// L2 node that never answers a put.
    struct HungStorage;

    #[async_trait]
    impl StorageTransport for HungStorage {
        async fn put(&self, _: &StorageNode, _: &str, _: Bytes) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn get(&self, _: &StorageNode, _: &str) -> Result<Option<Bytes>, TransportError> {
            Ok(None)
        }

        async fn exists(&self, _: &StorageNode, _: &str) -> Result<bool, TransportError> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_through_mirror_timeout_keeps_l1_success() {
        let devices = Arc::new(DeviceMemory::new(1, 4096));
        let transfer: Arc<dyn TransferHandler> = Arc::new(
            HostTransferHandler::new(devices.clone(), Arc::new(HostPool::new(100)))
                .with_copy_latency(Duration::from_millis(50)),
        );
        let controller = Arc::new(Controller::with_seed_nodes(
            Duration::from_secs(10),
            vec![StorageNode::new("redis-0", "10.1.1.10", 6379)],
        ));
        let l2 = Arc::new(L2Connector::new(3, Arc::new(HungStorage), controller));
        l2.initialize().await;
        let l1 = Arc::new(L1Cache::new(100, transfer.clone()));
        let manager = TieredCacheManager::new(l1, l2, transfer, TieringPolicy::WriteThrough);

        let key = CacheKey::from("mirrored");
        let status = manager
            .offload(&key, &BlockReference::new(0, 0, 40), Some(Duration::from_millis(100)))
            .await;
        assert!(status.success, "{}", status.message);
        assert_eq!(status.message, "stored in L1 (L2 mirror timed out)");
        assert!(manager.l1().contains(&key).await);

        let stats = manager.stats().await;
        assert_eq!(stats.offloads_l1, 1);
        assert_eq!(stats.offload_failures, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_request_l1_space_delegates_to_eviction() {
        let r = rig(TieringPolicy::Exclusive, 100, Duration::ZERO).await;
        for (i, key) in ["a", "b"].iter().enumerate() {
            let block = BlockReference::new(0, i as u64 * 50, 50);
            assert!(r.manager.offload(&CacheKey::from(*key), &block, None).await.success);
        }

        assert!(r.manager.request_l1_space(30).await.success);
        assert!(!r.manager.l1().contains(&CacheKey::from("a")).await);
        assert!(r.manager.l1().contains(&CacheKey::from("b")).await);

        let too_big = r.manager.request_l1_space(101).await;
        assert_eq!(too_big.code, StatusCode::CapacityExhausted);
    }
}
