//! L2 storage fleet: membership, placement and remote access.
//!
//! - [`node`]: StorageNode identity and health
//! - [`ring`]: Consistent hash ring with virtual nodes
//! - [`controller`]: Topology controller and heartbeat-timeout sweep
//! - [`topology`]: TopologySource trait and the HTTP controller client
//! - [`store`]: Bounded in-memory block map held by each storage node
//! - [`transport`]: StorageTransport trait, HTTP and in-memory transports
//! - [`connector`]: L2 connector routing put/get through the ring

pub mod connector;
pub mod controller;
pub mod node;
pub mod ring;
pub mod store;
pub mod topology;
pub mod transport;
