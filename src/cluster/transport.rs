//! Wire access to storage nodes.
//!
//! The connector only ever talks to storage through [`StorageTransport`], so
//! placement and tiering logic run unchanged against the HTTP client or the
//! in-memory fake used in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info};

use crate::cluster::node::StorageNode;
use crate::cluster::store::BlockStore;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("Node {node} is out of space")]
    NodeFull { node: String },

    #[error("Node {node} answered HTTP {status}")]
    Protocol { node: String, status: u16 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    fn unreachable(node: &StorageNode, reason: impl ToString) -> Self {
        TransportError::Unreachable {
            node: node.node_id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Put/get/exists against one storage node.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn put(&self, node: &StorageNode, key: &str, data: Bytes) -> Result<(), TransportError>;

    /// `Ok(None)` means the node answered and does not hold `key`.
    async fn get(&self, node: &StorageNode, key: &str) -> Result<Option<Bytes>, TransportError>;

    async fn exists(&self, node: &StorageNode, key: &str) -> Result<bool, TransportError>;

    /// Drop pooled connections.
    async fn close(&self) {}
}

/// HTTP transport with one lazily-built client per node address.
///
/// Each `reqwest::Client` keeps its own keep-alive pool and pairs every
/// response with its request.
pub struct HttpTransport {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn client_for(&self, node: &StorageNode) -> Result<reqwest::Client, TransportError> {
        let address = node.address();
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&address) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        debug!(address, "Opened storage connection pool");
        clients.insert(address, client.clone());
        Ok(client)
    }

    /// Pools currently open.
    pub fn pool_size(&self) -> usize {
        self.clients.lock().len()
    }
}

/// `http://host:port/v1/blocks/{key}` with the key percent-encoded.
pub fn block_url(node: &StorageNode, key: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(&format!("http://{}/", node.address()))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::InvalidRequest(format!("cannot-be-a-base url for {node}")))?
        .pop_if_empty()
        .extend(["v1", "blocks", key]);
    Ok(url)
}

#[async_trait]
impl StorageTransport for HttpTransport {
    async fn put(&self, node: &StorageNode, key: &str, data: Bytes) -> Result<(), TransportError> {
        let url = block_url(node, key)?;
        let response = self
            .client_for(node)?
            .put(url)
            .body(data)
            .send()
            .await
            .map_err(|e| TransportError::unreachable(node, e))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::INSUFFICIENT_STORAGE => Err(TransportError::NodeFull {
                node: node.node_id.clone(),
            }),
            s => Err(TransportError::Protocol {
                node: node.node_id.clone(),
                status: s.as_u16(),
            }),
        }
    }

    async fn get(&self, node: &StorageNode, key: &str) -> Result<Option<Bytes>, TransportError> {
        let url = block_url(node, key)?;
        let response = self
            .client_for(node)?
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::unreachable(node, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|e| TransportError::unreachable(node, e)),
            s => Err(TransportError::Protocol {
                node: node.node_id.clone(),
                status: s.as_u16(),
            }),
        }
    }

    async fn exists(&self, node: &StorageNode, key: &str) -> Result<bool, TransportError> {
        let url = block_url(node, key)?;
        let response = self
            .client_for(node)?
            .head(url)
            .send()
            .await
            .map_err(|e| TransportError::unreachable(node, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(TransportError::Protocol {
                node: node.node_id.clone(),
                status: s.as_u16(),
            }),
        }
    }

    async fn close(&self) {
        let mut clients = self.clients.lock();
        if !clients.is_empty() {
            info!(pools = clients.len(), "Closing storage connection pools");
        }
        clients.clear();
    }
}

/// In-process fleet: one [`BlockStore`] per node id.
///
/// Nodes can be made unreachable to exercise the failure paths.
#[derive(Default)]
pub struct InMemoryTransport {
    stores: Mutex<HashMap<String, Arc<BlockStore>>>,
    unreachable: Mutex<HashSet<String>>,
    max_bytes_per_node: u64,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node's store is capped at `max_bytes`.
    pub fn with_node_capacity(max_bytes: u64) -> Self {
        Self {
            max_bytes_per_node: max_bytes,
            ..Self::default()
        }
    }

    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(node_id);
        } else {
            unreachable.insert(node_id.to_string());
        }
    }

    /// The store backing `node_id`, if anything was ever written to it.
    pub fn store(&self, node_id: &str) -> Option<Arc<BlockStore>> {
        self.stores.lock().get(node_id).cloned()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Total blocks held across the fleet.
    pub fn total_blocks(&self) -> usize {
        self.stores.lock().values().map(|s| s.len()).sum()
    }

    fn check_reachable(&self, node: &StorageNode) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(&node.node_id) {
            return Err(TransportError::unreachable(node, "connection refused"));
        }
        Ok(())
    }

    fn store_or_create(&self, node_id: &str) -> Arc<BlockStore> {
        self.stores
            .lock()
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(BlockStore::new(self.max_bytes_per_node)))
            .clone()
    }
}

#[async_trait]
impl StorageTransport for InMemoryTransport {
    async fn put(&self, node: &StorageNode, key: &str, data: Bytes) -> Result<(), TransportError> {
        self.check_reachable(node)?;
        self.store_or_create(&node.node_id)
            .put(key, data)
            .map_err(|_| TransportError::NodeFull {
                node: node.node_id.clone(),
            })
    }

    async fn get(&self, node: &StorageNode, key: &str) -> Result<Option<Bytes>, TransportError> {
        self.check_reachable(node)?;
        Ok(self.store(&node.node_id).and_then(|s| s.get(key)))
    }

    async fn exists(&self, node: &StorageNode, key: &str) -> Result<bool, TransportError> {
        self.check_reachable(node)?;
        Ok(self.store(&node.node_id).is_some_and(|s| s.contains(key)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_url_encodes_key() {
        let node = StorageNode::new("redis-0", "10.1.1.10", 6379);
        let url = block_url(&node, "prefix/abc def").unwrap();
        assert_eq!(url.as_str(), "http://10.1.1.10:6379/v1/blocks/prefix%2Fabc%20def");
    }

    #[tokio::test]
    async fn test_in_memory_miss_vs_unreachable() {
        let transport = InMemoryTransport::new();
        let node = StorageNode::new("redis-0", "10.1.1.10", 6379);

        assert!(transport.get(&node, "k").await.unwrap().is_none());
        transport.put(&node, "k", Bytes::from_static(b"v")).await.unwrap();
        assert!(transport.exists(&node, "k").await.unwrap());

        transport.set_reachable("redis-0", false);
        assert!(matches!(
            transport.get(&node, "k").await,
            Err(TransportError::Unreachable { .. })
        ));

        transport.set_reachable("redis-0", true);
        assert_eq!(transport.get(&node, "k").await.unwrap().unwrap(), "v");
    }

    #[tokio::test]
    async fn test_in_memory_node_full() {
        let transport = InMemoryTransport::with_node_capacity(4);
        let node = StorageNode::new("redis-0", "10.1.1.10", 6379);
        assert!(matches!(
            transport.put(&node, "k", Bytes::from_static(b"too long")).await,
            Err(TransportError::NodeFull { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_pool_is_per_address_and_closes() {
        let transport = HttpTransport::new(Duration::from_secs(1));
        let a = StorageNode::new("redis-0", "10.1.1.10", 6379);
        let b = StorageNode::new("redis-1", "10.1.1.11", 6379);
        transport.client_for(&a).unwrap();
        transport.client_for(&a).unwrap();
        transport.client_for(&b).unwrap();
        assert_eq!(transport.pool_size(), 2);

        transport.close().await;
        assert_eq!(transport.pool_size(), 0);
    }
}
