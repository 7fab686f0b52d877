//! Cluster topology controller: the single source of truth for membership.
//!
//! Storage nodes heartbeat in; a background sweep marks nodes DOWN when they
//! stay silent past the timeout. Only a received heartbeat (or registration)
//! brings a node back UP; the sweep never does. Heartbeats and the sweep
//! take the same write lock, so a heartbeat racing a timeout flip is never
//! lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::node::{NodeHealth, StorageNode};
use crate::cluster::topology::{TopologyError, TopologySource};

/// Result of processing a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    /// Liveness refreshed; `readmitted` if the node was DOWN.
    Accepted { readmitted: bool },
    /// Timestamp older than one already accepted by an UP node; liveness
    /// unchanged.
    Stale,
}

#[derive(Debug)]
struct NodeRecord {
    node: StorageNode,
    last_seen: Instant,
    last_timestamp_ms: u64,
}

/// Diagnostic view of a node, DOWN nodes included.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    #[serde(flatten)]
    pub node: StorageNode,
    pub last_seen_ms_ago: u64,
}

pub struct Controller {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    heartbeat_timeout: Duration,
}

impl Controller {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Controller bootstrapped with `seeds`, all UP and on a fresh timer.
    pub fn with_seed_nodes(heartbeat_timeout: Duration, seeds: Vec<StorageNode>) -> Self {
        let controller = Self::new(heartbeat_timeout);
        for node in seeds {
            controller.register(node);
        }
        info!(
            nodes = controller.nodes.read().len(),
            "Controller initialized with seed storage nodes"
        );
        controller
    }

    /// Add a node or refresh its address; it becomes UP either way.
    /// Returns `true` for a node not seen before.
    pub fn register(&self, node: StorageNode) -> bool {
        let mut nodes = self.nodes.write();
        let now = Instant::now();
        let node = node.with_health(NodeHealth::Up);
        match nodes.get_mut(&node.node_id) {
            Some(record) => {
                if !record.node.is_up() {
                    info!(node = %node, "Storage node re-registered, marking UP");
                }
                record.node = node;
                record.last_seen = now;
                record.last_timestamp_ms = 0;
                false
            }
            None => {
                info!(node = %node, "Registered storage node");
                nodes.insert(
                    node.node_id.clone(),
                    NodeRecord {
                        node,
                        last_seen: now,
                        last_timestamp_ms: 0,
                    },
                );
                true
            }
        }
    }

    /// Record a heartbeat from `node_id` sent at `timestamp_ms`.
    pub fn heartbeat(&self, node_id: &str, timestamp_ms: u64) -> Result<HeartbeatAck, TopologyError> {
        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| TopologyError::UnknownNode(node_id.to_string()))?;

        // A DOWN node is readmitted by any heartbeat, so a clock that stepped
        // backwards cannot keep it out of the map.
        let down = record.node.health == NodeHealth::Down;
        if !down && timestamp_ms < record.last_timestamp_ms {
            debug!(
                node_id,
                timestamp_ms,
                last = record.last_timestamp_ms,
                "Ignoring stale heartbeat"
            );
            return Ok(HeartbeatAck::Stale);
        }

        record.last_timestamp_ms = timestamp_ms;
        record.last_seen = Instant::now();

        let readmitted = down;
        if readmitted {
            record.node.health = NodeHealth::Up;
            info!(node_id, "Heartbeat received from DOWN node, marking UP");
        } else {
            debug!(node_id, "Received heartbeat");
        }
        Ok(HeartbeatAck::Accepted { readmitted })
    }

    /// Mark UP nodes silent for longer than the timeout as DOWN.
    /// Returns the ids that flipped.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut nodes = self.nodes.write();
        let mut flipped = Vec::new();
        for record in nodes.values_mut() {
            if record.node.is_up() && now.duration_since(record.last_seen) > self.heartbeat_timeout {
                record.node.health = NodeHealth::Down;
                warn!(
                    node = %record.node,
                    silent_ms = now.duration_since(record.last_seen).as_millis() as u64,
                    "Storage node missed heartbeats, marking DOWN"
                );
                flipped.push(record.node.node_id.clone());
            }
        }
        flipped.sort();
        flipped
    }

    /// Routable membership: UP nodes, ordered by id.
    pub fn get_cluster_map(&self) -> Vec<StorageNode> {
        let mut active: Vec<StorageNode> = self
            .nodes
            .read()
            .values()
            .filter(|r| r.node.is_up())
            .map(|r| r.node.clone())
            .collect();
        active.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        active
    }

    /// Every known node with its health, for diagnostics.
    pub fn node_statuses(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let mut all: Vec<NodeStatus> = self
            .nodes
            .read()
            .values()
            .map(|r| NodeStatus {
                node: r.node.clone(),
                last_seen_ms_ago: now.duration_since(r.last_seen).as_millis() as u64,
            })
            .collect();
        all.sort_by(|a, b| a.node.node_id.cmp(&b.node.node_id));
        all
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run_health_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = interval.as_millis() as u64,
            timeout_ms = self.heartbeat_timeout.as_millis() as u64,
            "Health check loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let flipped = self.sweep();
                    if !flipped.is_empty() {
                        info!(down = ?flipped, active = self.get_cluster_map().len(), "Cluster map changed");
                    }
                }
            }
        }
        info!("Health check loop stopped");
    }
}

#[async_trait]
impl TopologySource for Controller {
    async fn cluster_map(&self) -> Result<Vec<StorageNode>, TopologyError> {
        Ok(self.get_cluster_map())
    }
}
