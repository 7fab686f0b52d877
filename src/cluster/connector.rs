//! L2 connector: the whole storage fleet behind `put`/`get`.
//!
//! Keys are placed through a [`HashRing`] replicated from the controller.
//! The ring is swapped wholesale behind an `Arc`, so lookups always see a
//! complete ring and never wait on a rebuild. A failed refresh leaves the
//! previous ring in place; only a ring that was never synced refuses to
//! route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::block::CacheKey;
use crate::cache::codec::BlockCodec;
use crate::cluster::node::StorageNode;
use crate::cluster::ring::HashRing;
use crate::cluster::topology::{TopologyError, TopologySource};
use crate::cluster::transport::{StorageTransport, TransportError};
use crate::status::{Status, StatusCode};

pub const NO_NODES_MESSAGE: &str = "No storage nodes available.";
pub const MISS_MESSAGE: &str = "Key not found (cache miss)";

#[derive(Debug, Default)]
struct ConnectorCounters {
    puts: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    unavailable: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStats {
    pub ring_nodes: usize,
    pub virtual_nodes: usize,
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub unavailable: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub compression: bool,
}

pub struct L2Connector {
    ring: RwLock<Arc<HashRing>>,
    transport: Arc<dyn StorageTransport>,
    topology: Arc<dyn TopologySource>,
    codec: BlockCodec,
    counters: ConnectorCounters,
}

impl L2Connector {
    pub fn new(
        virtual_nodes: usize,
        transport: Arc<dyn StorageTransport>,
        topology: Arc<dyn TopologySource>,
    ) -> Self {
        Self {
            ring: RwLock::new(Arc::new(HashRing::new(virtual_nodes))),
            transport,
            topology,
            codec: BlockCodec::raw(),
            counters: ConnectorCounters::default(),
        }
    }

    pub fn with_codec(mut self, codec: BlockCodec) -> Self {
        self.codec = codec;
        self
    }

    /// First sync with the controller. A failure is logged and left for the
    /// refresh loop to retry.
    pub async fn initialize(&self) {
        match self.refresh().await {
            Ok(nodes) => info!(nodes, "L2 connector initialized"),
            Err(e) => warn!(error = %e, "Initial topology sync failed, L2 unroutable until next refresh"),
        }
    }

    /// Pull the cluster map and swap in a freshly built ring.
    /// Returns the number of nodes in the new ring.
    pub async fn refresh(&self) -> Result<usize, TopologyError> {
        let nodes = match self.topology.cluster_map().await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
                let kept = self.ring.read().len();
                warn!(error = %e, kept_nodes = kept, "Topology refresh failed, keeping previous ring");
                return Err(e);
            }
        };

        let virtual_nodes = self.ring.read().virtual_nodes();
        let ring = HashRing::with_nodes(virtual_nodes, nodes);
        let count = ring.len();
        *self.ring.write() = Arc::new(ring);
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Refresh every `interval` until `cancel` fires, then close the pool.
    pub async fn run_refresh_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; initialize() already synced.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Ok(nodes) = self.refresh().await {
                        debug!(nodes, "Topology refreshed");
                    }
                }
            }
        }
        self.close().await;
        info!("Topology refresh loop stopped");
    }

    /// Current ring snapshot.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Node that owns `key` under the current ring.
    pub fn owner(&self, key: &CacheKey) -> Option<StorageNode> {
        self.ring.read().get_node(key.as_str()).cloned()
    }

    fn route(&self, key: &CacheKey) -> Result<StorageNode, Status> {
        self.owner(key).ok_or_else(|| {
            self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
            Status::unavailable(NO_NODES_MESSAGE)
        })
    }

    fn transport_failure(&self, node: &StorageNode, e: TransportError) -> Status {
        match e {
            TransportError::NodeFull { .. } => {
                warn!(node = %node, "Storage node out of space");
                Status::failure(StatusCode::CapacityExhausted, e.to_string())
            }
            e => {
                self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                warn!(node = %node, error = %e, "Storage node request failed");
                Status::unavailable(e.to_string())
            }
        }
    }

    pub async fn put(&self, key: &CacheKey, data: &[u8]) -> Status {
        let node = match self.route(key) {
            Ok(node) => node,
            Err(status) => return status,
        };
        let framed = match self.codec.encode(data) {
            Ok(framed) => framed,
            Err(e) => {
                return Status::failure(StatusCode::TransferFailed, format!("encode failed: {e}"))
            }
        };
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        let stored = framed.len();
        match self.transport.put(&node, key.as_str(), framed).await {
            Ok(()) => {
                debug!(key = %key, node = %node.node_id, size = data.len(), stored, "Stored block in L2");
                Status::ok(format!("Stored on {}", node.node_id))
            }
            Err(e) => self.transport_failure(&node, e),
        }
    }

    /// On a hit the decoded bytes are carried in `Status::payload`.
    pub async fn get(&self, key: &CacheKey) -> Status {
        let node = match self.route(key) {
            Ok(node) => node,
            Err(status) => return status,
        };
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        match self.transport.get(&node, key.as_str()).await {
            Ok(Some(framed)) => match self.codec.decode(&framed) {
                Ok(data) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Status::ok_with_payload(format!("Loaded from {}", node.node_id), data)
                }
                Err(e) => {
                    warn!(key = %key, node = %node.node_id, error = %e, "Corrupt L2 block");
                    Status::failure(StatusCode::TransferFailed, format!("decode failed: {e}"))
                }
            },
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Status::not_found(MISS_MESSAGE)
            }
            Err(e) => self.transport_failure(&node, e),
        }
    }

    /// Existence check on the owning node, without moving data.
    pub async fn exists(&self, key: &CacheKey) -> Status {
        let node = match self.route(key) {
            Ok(node) => node,
            Err(status) => return status,
        };
        match self.transport.exists(&node, key.as_str()).await {
            Ok(true) => Status::ok(format!("Present on {}", node.node_id)),
            Ok(false) => Status::not_found(MISS_MESSAGE),
            Err(e) => self.transport_failure(&node, e),
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub fn stats(&self) -> ConnectorStats {
        let c = &self.counters;
        let ring = self.ring();
        ConnectorStats {
            ring_nodes: ring.len(),
            virtual_nodes: ring.virtual_nodes(),
            puts: c.puts.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            unavailable: c.unavailable.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            compression: self.codec.compresses(),
        }
    }
}

/// Payload bytes of a successful `get`, or empty.
pub fn payload_of(status: &Status) -> Bytes {
    status.payload.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::controller::Controller;
    use crate::cluster::transport::InMemoryTransport;

    fn fleet(ids: &[&str]) -> Arc<Controller> {
        Arc::new(Controller::with_seed_nodes(
            Duration::from_secs(10),
            ids.iter()
                .enumerate()
                .map(|(i, id)| StorageNode::new(*id, "10.1.1.10", 6379 + i as u16))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_unsynced_connector_is_unavailable() {
        let connector = L2Connector::new(3, Arc::new(InMemoryTransport::new()), fleet(&[]));
        connector.initialize().await;

        let status = connector.get(&CacheKey::from("k")).await;
        assert_eq!(status.code, StatusCode::Unavailable);
        assert_eq!(status.message, NO_NODES_MESSAGE);
    }

    #[tokio::test]
    async fn test_put_get_and_miss() {
        let transport = Arc::new(InMemoryTransport::new());
        let connector = L2Connector::new(3, transport.clone(), fleet(&["redis-0", "redis-1"]))
            .with_codec(BlockCodec::new(true, 3));
        connector.initialize().await;

        let key = CacheKey::from("prefix-1");
        let owner = connector.owner(&key).unwrap();
        let put = connector.put(&key, &[5u8; 512]).await;
        assert!(put.success);
        assert_eq!(put.message, format!("Stored on {}", owner.node_id));
        assert!(transport.store(&owner.node_id).unwrap().contains("prefix-1"));

        let got = connector.get(&key).await;
        assert!(got.success);
        assert_eq!(payload_of(&got).as_ref(), &[5u8; 512][..]);

        let miss = connector.get(&CacheKey::from("never-stored")).await;
        assert!(miss.is_miss());
        assert_eq!(miss.message, MISS_MESSAGE);
        assert!(connector.exists(&key).await.success);
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_not_a_miss() {
        let transport = Arc::new(InMemoryTransport::new());
        let connector = L2Connector::new(3, transport.clone(), fleet(&["redis-0"]));
        connector.initialize().await;

        transport.set_reachable("redis-0", false);
        let status = connector.get(&CacheKey::from("k")).await;
        assert!(!status.success);
        assert!(!status.is_miss());
        assert_eq!(status.code, StatusCode::Unavailable);
        assert_eq!(connector.stats().unavailable, 1);
    }
}
