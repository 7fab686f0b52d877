//! Data movement between device memory and the L1 host pool.
//!
//! - [`device`]: Device memory regions and the pinned host pool
//! - [`handler`]: TransferHandler trait, host-backed engine and statistics

pub mod device;
pub mod handler;
