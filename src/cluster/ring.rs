//! Consistent hash ring: places cache keys on storage nodes.
//!
//! Each physical node owns `virtual_nodes` ring positions at
//! `hash("{node_id}-{i}")`. A key belongs to the node owning the first
//! position at or after `hash(key)`, wrapping to the smallest position.
//! Positions are SHA-256 truncated to 64 bits so placement is stable across
//! processes and restarts.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::cluster::node::StorageNode;

pub const DEFAULT_VIRTUAL_NODES: usize = 3;

/// Stable 64-bit ring position for `value`.
pub fn ring_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Sorted virtual-node positions → owning node.
///
/// Rebuilt from scratch on every membership change; never patched.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    positions: BTreeMap<u64, StorageNode>,
    members: Vec<StorageNode>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    /// Build a ring over `nodes` in one step.
    pub fn with_nodes(virtual_nodes: usize, nodes: impl IntoIterator<Item = StorageNode>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        ring.update_nodes(nodes);
        ring
    }

    /// Replace the membership. Nodes that are not UP are left out; duplicate
    /// ids keep the last entry given.
    pub fn update_nodes(&mut self, nodes: impl IntoIterator<Item = StorageNode>) {
        let mut by_id: BTreeMap<String, StorageNode> = BTreeMap::new();
        for node in nodes.into_iter().filter(StorageNode::is_up) {
            by_id.insert(node.node_id.clone(), node);
        }

        self.positions.clear();
        self.members = by_id.into_values().collect();

        // Members are sorted by id, so a position collision always resolves
        // to the same node.
        for node in &self.members {
            for replica in 0..self.virtual_nodes {
                let position = ring_hash(&format!("{}-{}", node.node_id, replica));
                self.positions.entry(position).or_insert_with(|| node.clone());
            }
        }

        info!(
            nodes = self.members.len(),
            positions = self.positions.len(),
            "Updated hash ring"
        );
    }

    /// The node responsible for `key`, or `None` if the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<&StorageNode> {
        let hash = ring_hash(key);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node)
    }

    pub fn members(&self) -> &[StorageNode] {
        &self.members
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.members.iter().any(|n| n.node_id == node_id)
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of physical nodes.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Fraction of the hash space owned by each node.
    pub fn ownership_share(&self) -> HashMap<String, f64> {
        const SPACE: f64 = u64::MAX as f64 + 1.0;
        let mut shares = HashMap::new();
        if self.positions.len() == 1 {
            if let Some(node) = self.positions.values().next() {
                shares.insert(node.node_id.clone(), 1.0);
            }
            return shares;
        }

        let mut prev = self.positions.keys().next_back().copied().unwrap_or(0);
        for (&position, node) in &self.positions {
            let arc = position.wrapping_sub(prev) as f64 / SPACE;
            *shares.entry(node.node_id.clone()).or_insert(0.0) += arc;
            prev = position;
        }
        shares
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
