//! L1 tier: pinned host RAM in front of the remote fleet.
//!
//! Composes the [`L1Allocator`], an [`EvictionPolicy`] and a
//! [`TransferHandler`] behind `put`/`get`, and owns the key → allocation map.
//!
//! All state lives behind one async mutex that is held across the transfer,
//! so a block is only ever mapped once its copy has completed and a reader
//! can never observe an extent that is being freed underneath it. A put that
//! is cancelled mid-transfer releases its reservation through
//! [`Reservation`]'s drop.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::allocator::L1Allocator;
use crate::cache::block::{AllocationPointer, BlockReference, CacheKey};
use crate::cache::evictor::{EvictionPolicy, LruPolicy};
use crate::status::{Status, StatusCode};
use crate::transfer::handler::TransferHandler;

/// L1 counters and occupancy, for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    /// Sum of sizes of mapped blocks. Equals `used_bytes` between operations.
    pub resident_bytes: u64,
    pub resident_blocks: usize,
    /// Extents the allocator considers live.
    pub live_extents: usize,
    pub tracked_keys: usize,
    pub tracked_bytes: u64,
    /// Largest contiguous free extent; below `capacity - used` when fragmented.
    pub largest_free_extent: u64,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub rejections: u64,
    pub policy: String,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
    rejections: u64,
}

struct L1State {
    allocator: L1Allocator,
    entries: HashMap<CacheKey, AllocationPointer>,
    policy: Box<dyn EvictionPolicy>,
    counters: Counters,
}

impl L1State {
    /// Drop a resident key: unmap, free its extent, stop tracking it.
    fn evict(&mut self, key: &CacheKey) -> Option<AllocationPointer> {
        self.policy.remove(key);
        let pointer = self.entries.remove(key)?;
        if let Err(e) = self.allocator.free(&pointer) {
            warn!(key = %key, error = %e, "L1 map referenced an extent the allocator did not own");
        }
        self.counters.evictions += 1;
        debug!(key = %key, size = pointer.size_bytes, "Evicted L1 block");
        Some(pointer)
    }

    /// Allocate `size` bytes, evicting victims until it fits or none remain.
    /// `pinned` is never chosen as a victim.
    fn reserve(
        &mut self,
        size: u64,
        pinned: Option<&CacheKey>,
    ) -> Result<(AllocationPointer, usize), Status> {
        if size == 0 {
            return Err(Status::failure(
                StatusCode::InvalidArgument,
                "block size must be non-zero",
            ));
        }
        if size > self.allocator.capacity_bytes() {
            return Err(Status::failure(
                StatusCode::CapacityExhausted,
                format!(
                    "block of {size} bytes exceeds L1 capacity of {} bytes",
                    self.allocator.capacity_bytes()
                ),
            ));
        }

        let mut evicted = 0;
        let mut pinned_bumped = false;
        loop {
            match self.allocator.allocate(size) {
                Ok(pointer) => return Ok((pointer, evicted)),
                Err(e) if e.is_capacity() => {
                    let victim = match self.policy.select_victim() {
                        Some(victim) if Some(&victim) == pinned && !pinned_bumped => {
                            self.policy.record_access(&victim);
                            pinned_bumped = true;
                            continue;
                        }
                        Some(victim) if Some(&victim) != pinned => victim,
                        _ => {
                            return Err(Status::failure(
                                StatusCode::CapacityExhausted,
                                format!("L1 full and no victims to evict: {e}"),
                            ))
                        }
                    };
                    if self.evict(&victim).is_some() {
                        evicted += 1;
                    }
                }
                Err(e) => {
                    return Err(Status::failure(StatusCode::InvalidArgument, e.to_string()))
                }
            }
        }
    }

    fn resident_bytes(&self) -> u64 {
        self.entries.values().map(|p| p.size_bytes).sum()
    }
}

/// An extent that is allocated but not yet mapped.
///
/// Freed on drop unless [`Reservation::commit`] is called.
struct Reservation<'a> {
    allocator: &'a mut L1Allocator,
    pointer: AllocationPointer,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn new(allocator: &'a mut L1Allocator, pointer: AllocationPointer) -> Self {
        Self {
            allocator,
            pointer,
            committed: false,
        }
    }

    fn commit(mut self) -> AllocationPointer {
        self.committed = true;
        self.pointer
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.allocator.free(&self.pointer) {
            Ok(()) => debug!(
                offset = self.pointer.host_address,
                size = self.pointer.size_bytes,
                "Rolled back L1 reservation"
            ),
            Err(e) => warn!(error = %e, "Failed to roll back L1 reservation"),
        }
    }
}

/// The L1 facade used by the tiered cache manager.
pub struct L1Cache {
    state: Mutex<L1State>,
    transfer: Arc<dyn TransferHandler>,
}

impl L1Cache {
    /// L1 cache with the default LRU policy.
    pub fn new(capacity_bytes: u64, transfer: Arc<dyn TransferHandler>) -> Self {
        Self::with_policy(capacity_bytes, Box::new(LruPolicy::new()), transfer)
    }

    pub fn with_policy(
        capacity_bytes: u64,
        policy: Box<dyn EvictionPolicy>,
        transfer: Arc<dyn TransferHandler>,
    ) -> Self {
        info!(
            capacity = capacity_bytes,
            policy = policy.name(),
            "L1 cache initialized"
        );
        Self {
            state: Mutex::new(L1State {
                allocator: L1Allocator::new(capacity_bytes),
                entries: HashMap::new(),
                policy,
                counters: Counters::default(),
            }),
            transfer,
        }
    }

    /// Offload a device block into L1, evicting LRU victims as needed.
    ///
    /// Keys are content-derived, so a resident key of the same size is only
    /// touched. A resident key of a different size is replaced: the new copy
    /// is staged in a fresh extent and the old one stays mapped until that
    /// copy completes. Only when the pool cannot hold both is the old extent
    /// released up front.
    pub async fn put(&self, key: &CacheKey, block: &BlockReference) -> Status {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let previous = state.entries.get(key).copied();
        if let Some(old) = previous {
            if old.size_bytes == block.size_bytes {
                state.policy.record_access(key);
                debug!(key = %key, size = old.size_bytes, "Block already resident in L1");
                return Status::ok(format!("{} bytes already resident in L1", old.size_bytes));
            }
        }

        let reserved = match state.reserve(block.size_bytes, previous.as_ref().map(|_| key)) {
            Err(status)
                if status.code == StatusCode::CapacityExhausted
                    && previous.is_some()
                    && block.size_bytes <= state.allocator.capacity_bytes() =>
            {
                state.evict(key);
                state.reserve(block.size_bytes, None)
            }
            other => other,
        };
        let (pointer, evicted) = match reserved {
            Ok(reserved) => reserved,
            Err(status) => {
                state.counters.rejections += 1;
                return status;
            }
        };

        let reservation = Reservation::new(&mut state.allocator, pointer);
        match self.transfer.device_to_host(block, &pointer).await {
            Ok(report) => {
                let pointer = reservation.commit();
                if let Some(old) = state.entries.insert(key.clone(), pointer) {
                    if let Err(e) = state.allocator.free(&old) {
                        warn!(key = %key, error = %e, "Replaced L1 extent was not owned by the allocator");
                    }
                    debug!(key = %key, old_size = old.size_bytes, "Replaced resident L1 block");
                }
                state.policy.track_new(key, pointer.size_bytes);
                state.counters.insertions += 1;
                debug!(
                    key = %key,
                    size = report.bytes,
                    offset = pointer.host_address,
                    evicted,
                    elapsed_us = report.elapsed.as_micros() as u64,
                    "Stored block in L1"
                );
                Status::ok(format!(
                    "stored {} bytes in L1 (evicted {evicted})",
                    pointer.size_bytes
                ))
            }
            Err(e) => {
                drop(reservation);
                state.counters.rejections += 1;
                warn!(key = %key, error = %e, "L1 offload transfer failed");
                Status::failure(StatusCode::TransferFailed, format!("L1 transfer failed: {e}"))
            }
        }
    }

    /// Restore a resident block into device memory.
    ///
    /// Recency is only updated when the copy succeeds.
    pub async fn get(&self, key: &CacheKey, dest: &BlockReference) -> Status {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(pointer) = state.entries.get(key).copied() else {
            state.counters.misses += 1;
            return Status::not_found("L1 miss");
        };

        match self.transfer.host_to_device(&pointer, dest).await {
            Ok(_) => {
                state.policy.record_access(key);
                state.counters.hits += 1;
                Status::ok(format!("loaded {} bytes from L1", pointer.size_bytes))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "L1 fetch transfer failed");
                Status::failure(StatusCode::TransferFailed, format!("L1 transfer failed: {e}"))
            }
        }
    }

    /// Copy a resident block's bytes out of the host pool.
    pub async fn read(&self, key: &CacheKey) -> Option<Bytes> {
        let guard = self.state.lock().await;
        let pointer = guard.entries.get(key).copied()?;
        match self.transfer.read_host(&pointer).await {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key = %key, error = %e, "L1 host read failed");
                None
            }
        }
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    /// Remove a key explicitly. Returns whether it was resident.
    pub async fn evict(&self, key: &CacheKey) -> bool {
        self.state.lock().await.evict(key).is_some()
    }

    /// Evict until at least `needed_bytes` are free.
    pub async fn make_room(&self, needed_bytes: u64) -> Status {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let capacity = state.allocator.capacity_bytes();
        if needed_bytes > capacity {
            return Status::failure(
                StatusCode::CapacityExhausted,
                format!("requested {needed_bytes} bytes exceeds L1 capacity of {capacity} bytes"),
            );
        }

        let mut evicted = 0usize;
        while state.allocator.available() < needed_bytes {
            let Some(victim) = state.policy.select_victim() else {
                break;
            };
            if state.evict(&victim).is_some() {
                evicted += 1;
            }
        }

        let available = state.allocator.available();
        if evicted > 0 {
            info!(evicted, available, needed = needed_bytes, "L1 eviction round complete");
        }
        if available >= needed_bytes {
            Status::ok(format!("{available} bytes free in L1 (evicted {evicted})"))
        } else {
            Status::failure(
                StatusCode::CapacityExhausted,
                format!("only {available} of {needed_bytes} bytes could be freed"),
            )
        }
    }

    pub async fn stats(&self) -> L1Stats {
        let state = self.state.lock().await;
        L1Stats {
            capacity_bytes: state.allocator.capacity_bytes(),
            used_bytes: state.allocator.used_bytes(),
            resident_bytes: state.resident_bytes(),
            resident_blocks: state.entries.len(),
            live_extents: state.allocator.live_count(),
            tracked_keys: state.policy.len(),
            tracked_bytes: state.policy.tracked_bytes(),
            largest_free_extent: state.allocator.largest_free_extent(),
            utilization: state.allocator.utilization(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            insertions: state.counters.insertions,
            evictions: state.counters.evictions,
            rejections: state.counters.rejections,
            policy: state.policy.name().to_string(),
        }
    }
}
