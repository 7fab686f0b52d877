//! Topology discovery: where connectors learn the current cluster map.
//!
//! [`TopologySource`] is the seam between the connector and the controller.
//! The controller implements it in-process; [`HttpTopologyClient`] reaches a
//! remote controller over HTTP and is also what storage nodes use to
//! register and heartbeat.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cluster::node::StorageNode;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Controller request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Controller returned HTTP {0}")]
    Status(u16),

    #[error("Unknown storage node: {0}")]
    UnknownNode(String),
}

/// Anything that can answer "which storage nodes are routable right now".
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// UP nodes only.
    async fn cluster_map(&self) -> Result<Vec<StorageNode>, TopologyError>;
}

// ─── Controller wire types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMapResponse {
    pub nodes: Vec<StorageNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    /// Sender's wall clock, unix milliseconds.
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

/// HTTP client for the controller surface.
#[derive(Debug, Clone)]
pub struct HttpTopologyClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTopologyClient {
    /// `controller_addr` is `host:port` or a full `http://` URL.
    pub fn new(controller_addr: &str, timeout: Duration) -> Result<Self, TopologyError> {
        let base_url = if controller_addr.starts_with("http://")
            || controller_addr.starts_with("https://")
        {
            controller_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{controller_addr}")
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn heartbeat(&self, node_id: &str, timestamp_ms: u64) -> Result<(), TopologyError> {
        let response = self
            .client
            .post(format!("{}/v1/cluster/heartbeat", self.base_url))
            .json(&HeartbeatRequest {
                node_id: node_id.to_string(),
                timestamp_ms,
            })
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(()),
            404 => Err(TopologyError::UnknownNode(node_id.to_string())),
            code => Err(TopologyError::Status(code)),
        }
    }

    pub async fn register(&self, node: &StorageNode) -> Result<(), TopologyError> {
        let response = self
            .client
            .post(format!("{}/v1/cluster/register", self.base_url))
            .json(&RegisterRequest {
                node_id: node.node_id.clone(),
                host: node.host.clone(),
                port: node.port,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TopologyError::Status(response.status().as_u16()));
        }
        debug!(node = %node, "Registered with controller");
        Ok(())
    }
}

#[async_trait]
impl TopologySource for HttpTopologyClient {
    async fn cluster_map(&self) -> Result<Vec<StorageNode>, TopologyError> {
        let response = self
            .client
            .get(format!("{}/v1/cluster/map", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TopologyError::Status(response.status().as_u16()));
        }
        let map: ClusterMapResponse = response.json().await?;
        Ok(map.nodes)
    }
}
