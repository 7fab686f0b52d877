//! Storage node identity and health.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Liveness of a storage node as judged by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeHealth {
    #[default]
    Up,
    Down,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeHealth::Up => write!(f, "UP"),
            NodeHealth::Down => write!(f, "DOWN"),
        }
    }
}

/// A member of the L2 storage fleet.
///
/// Created and mutated only by the controller; connectors hold read-only
/// snapshots. On the wire `health` may be omitted and defaults to `UP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNode {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub health: NodeHealth,
}

impl StorageNode {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            health: NodeHealth::Up,
        }
    }

    /// `host:port`, the key of the connector's connection pool.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.health == NodeHealth::Up
    }

    pub fn with_health(mut self, health: NodeHealth) -> Self {
        self.health = health;
        self
    }
}

impl fmt::Display for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}
