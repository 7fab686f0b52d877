//! kv-tier: two-tier KV-cache offloading for LLM inference.
//!
//! Attention-cache blocks leave device memory for a bounded pool of pinned
//! host RAM (L1) and, when L1 cannot take them, for a fleet of storage nodes
//! (L2) placed by consistent hashing:
//!   device memory → L1 host pool → L2 storage fleet
//!
//! Three process roles share this crate: the sidecar serving the cache API,
//! the topology controller, and the storage nodes.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod server;
pub mod status;
pub mod transfer;
