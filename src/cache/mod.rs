//! Local cache tier and the tiering policy on top of it.
//!
//! - [`block`]: CacheKey, BlockReference, AllocationPointer
//! - [`allocator`]: Best-fit free-list allocator over the pinned host pool
//! - [`evictor`]: Eviction policy trait and the LRU implementation
//! - [`l1`]: L1 cache composing allocator, policy and transfer handler
//! - [`codec`]: Payload framing (optional zstd) for blocks stored in L2
//! - [`manager`]: Multi-tiered cache manager (L1 first, L2 fallback)

pub mod allocator;
pub mod block;
pub mod codec;
pub mod evictor;
pub mod l1;
pub mod manager;
