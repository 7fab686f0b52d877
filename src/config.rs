//! Runtime configuration for kv-tier.
//!
//! One JSON file configures every role; each role reads its own section.
//! Missing fields fall back to defaults, and a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::manager::TieringPolicy;
use crate::cluster::node::StorageNode;
use crate::cluster::ring::DEFAULT_VIRTUAL_NODES;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-tier", about = "Two-tier KV-cache offload service", version)]
pub struct Cli {
    /// Process role.
    #[command(subcommand)]
    pub role: Role,

    /// Path to configuration file (JSON).
    #[arg(short, long, global = true, env = "KV_TIER_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address, overriding the role's configured one.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cache API facade with the L1 tier and the L2 connector.
    Sidecar,
    /// Cluster topology controller.
    Controller,
    /// L2 storage node.
    StorageNode,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sidecar: SidecarConfig,
    pub devices: DeviceConfig,
    pub ring: RingConfig,
    pub connector: ConnectorConfig,
    pub controller: ControllerConfig,
    pub storage_node: StorageNodeConfig,
}

/// Sidecar (facade + L1 + manager) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Listen address (e.g. "0.0.0.0:50051").
    pub listen: String,

    /// Pinned host pool size in bytes.
    pub l1_capacity_bytes: u64,

    pub tiering: TieringPolicy,

    /// Default deadline for offload/fetch calls that carry none (0 = none).
    pub op_timeout_ms: u64,

    /// zstd-frame payloads written to L2.
    pub compress_l2: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:50051".to_string(),
            l1_capacity_bytes: 1024 * 1024 * 1024, // 1 GB
            tiering: TieringPolicy::Exclusive,
            op_timeout_ms: 0,
            compress_l2: false,
            zstd_level: 3,
        }
    }
}

impl SidecarConfig {
    pub fn op_timeout(&self) -> Option<Duration> {
        (self.op_timeout_ms > 0).then(|| Duration::from_millis(self.op_timeout_ms))
    }
}

/// Simulated device memory the transfer handler copies from and to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub count: usize,
    /// Bytes per device.
    pub memory_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: 1,
            memory_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Ring positions per physical node.
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// L2 connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Controller address, `host:port` or URL.
    pub controller_addr: String,
    pub refresh_interval_ms: u64,
    /// Per-request timeout toward storage nodes and the controller.
    pub request_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            controller_addr: "127.0.0.1:50052".to_string(),
            refresh_interval_ms: 10_000,
            request_timeout_ms: 2_000,
        }
    }
}

impl ConnectorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Topology controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen: String,
    pub health_check_interval_ms: u64,
    /// Silence after which a node is marked DOWN.
    pub heartbeat_timeout_ms: u64,
    /// Bootstrap membership, initially UP.
    pub seed_nodes: Vec<StorageNode>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:50052".to_string(),
            health_check_interval_ms: 5_000,
            heartbeat_timeout_ms: 10_000,
            seed_nodes: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Storage node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    pub node_id: String,
    pub listen: String,
    /// Address other processes reach this node on.
    pub advertise_host: String,
    pub advertise_port: u16,
    pub controller_addr: String,
    pub heartbeat_interval_ms: u64,
    /// Store ceiling in bytes (0 = unbounded).
    pub max_bytes: u64,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            node_id: "storage-0".to_string(),
            listen: "0.0.0.0:6380".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            advertise_port: 6380,
            controller_addr: "127.0.0.1:50052".to_string(),
            heartbeat_interval_ms: 3_000,
            max_bytes: 0,
        }
    }
}

impl StorageNodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How this node announces itself to the controller.
    pub fn advertised_node(&self) -> StorageNode {
        StorageNode::new(&self.node_id, &self.advertise_host, self.advertise_port)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.sidecar.l1_capacity_bytes > 0, "sidecar.l1_capacity_bytes must be > 0");
        anyhow::ensure!(self.ring.virtual_nodes > 0, "ring.virtual_nodes must be > 0");
        anyhow::ensure!(self.devices.count > 0, "devices.count must be > 0");
        anyhow::ensure!(
            self.controller.heartbeat_timeout_ms > 0 && self.controller.health_check_interval_ms > 0,
            "controller intervals must be > 0"
        );
        anyhow::ensure!(
            self.connector.refresh_interval_ms > 0,
            "connector.refresh_interval_ms must be > 0"
        );
        anyhow::ensure!(
            self.storage_node.heartbeat_interval_ms > 0,
            "storage_node.heartbeat_interval_ms must be > 0"
        );
        Ok(())
    }

    /// Listen address for `role`, with the CLI override applied.
    pub fn listen_for(&self, role: Role, cli_listen: Option<&str>) -> String {
        if let Some(addr) = cli_listen {
            return addr.to_string();
        }
        match role {
            Role::Sidecar => self.sidecar.listen.clone(),
            Role::Controller => self.controller.listen.clone(),
            Role::StorageNode => self.storage_node.listen.clone(),
        }
    }
}
