//! HTTP surfaces for the three process roles.
//!
//! - [`cache_api`]: Cache API facade served by the sidecar
//! - [`controller_api`]: Cluster map, heartbeat and registration endpoints
//! - [`storage_node`]: Block store server and its heartbeat loop

pub mod cache_api;
pub mod controller_api;
pub mod storage_node;
