//! L1 host-pool allocator.
//!
//! Manages a fixed-capacity pinned host region. Free space is kept as
//! coalesced extents indexed both by offset (for merging on free) and by
//! size (for best-fit allocation in O(log n)), so mixed block sizes do not
//! strand capacity once neighbours are released.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::debug;

use crate::cache::block::AllocationPointer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("L1 pool full: requested {requested} bytes, {available} available")]
    Full { requested: u64, available: u64 },

    #[error("L1 pool fragmented: no contiguous extent of {requested} bytes ({available} free in total)")]
    Fragmented { requested: u64, available: u64 },

    #[error("Invalid allocation size: {0}")]
    InvalidSize(u64),

    #[error("No live allocation at host address {host_address:#x} of {size_bytes} bytes")]
    UnknownPointer { host_address: u64, size_bytes: u64 },
}

impl AllocatorError {
    /// Whether evicting resident blocks could make the request succeed.
    pub fn is_capacity(&self) -> bool {
        matches!(self, AllocatorError::Full { .. } | AllocatorError::Fragmented { .. })
    }
}

/// Allocator over the L1 pinned host pool.
#[derive(Debug)]
pub struct L1Allocator {
    /// Pool size in bytes.
    capacity: u64,

    /// Bytes currently reserved.
    used: u64,

    /// Free extents: offset -> length.
    free_by_offset: BTreeMap<u64, u64>,

    /// Free extents ordered by (length, offset) for best-fit.
    free_by_size: BTreeSet<(u64, u64)>,

    /// Live reservations: offset -> length.
    live: HashMap<u64, u64>,
}

impl L1Allocator {
    pub fn new(capacity_bytes: u64) -> Self {
        let mut allocator = Self {
            capacity: capacity_bytes,
            used: 0,
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            live: HashMap::new(),
        };
        if capacity_bytes > 0 {
            allocator.insert_free(0, capacity_bytes);
        }
        debug!(capacity = capacity_bytes, "L1 allocator initialized");
        allocator
    }

    /// Reserve `size` bytes.
    ///
    /// Fails with [`AllocatorError::Full`] when `used + size > capacity`.
    pub fn allocate(&mut self, size: u64) -> Result<AllocationPointer, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize(size));
        }
        let available = self.available();
        if size > available {
            return Err(AllocatorError::Full {
                requested: size,
                available,
            });
        }

        let (len, offset) = self
            .free_by_size
            .range((size, 0)..)
            .next()
            .copied()
            .ok_or(AllocatorError::Fragmented {
                requested: size,
                available,
            })?;

        self.remove_free(offset, len);
        if len > size {
            self.insert_free(offset + size, len - size);
        }

        self.live.insert(offset, size);
        self.used += size;

        debug!(offset, size, used = self.used, "Allocated L1 extent");
        Ok(AllocationPointer {
            host_address: offset,
            size_bytes: size,
        })
    }

    /// Release a reservation, merging it with adjacent free extents.
    pub fn free(&mut self, pointer: &AllocationPointer) -> Result<(), AllocatorError> {
        match self.live.get(&pointer.host_address) {
            Some(&size) if size == pointer.size_bytes => {}
            _ => {
                return Err(AllocatorError::UnknownPointer {
                    host_address: pointer.host_address,
                    size_bytes: pointer.size_bytes,
                })
            }
        }
        self.live.remove(&pointer.host_address);
        self.used -= pointer.size_bytes;

        let mut offset = pointer.host_address;
        let mut len = pointer.size_bytes;

        let prev = self
            .free_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &l)| (o, l));
        if let Some((prev_offset, prev_len)) = prev {
            if prev_offset + prev_len == offset {
                self.remove_free(prev_offset, prev_len);
                offset = prev_offset;
                len += prev_len;
            }
        }

        let next = self.free_by_offset.get(&(offset + len)).copied();
        if let Some(next_len) = next {
            self.remove_free(offset + len, next_len);
            len += next_len;
        }

        self.insert_free(offset, len);

        debug!(
            offset = pointer.host_address,
            size = pointer.size_bytes,
            used = self.used,
            "Freed L1 extent"
        );
        Ok(())
    }

    fn insert_free(&mut self, offset: u64, len: u64) {
        self.free_by_offset.insert(offset, len);
        self.free_by_size.insert((len, offset));
    }

    fn remove_free(&mut self, offset: u64, len: u64) {
        self.free_by_offset.remove(&offset);
        self.free_by_size.remove(&(len, offset));
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }

    /// Number of live reservations.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Largest contiguous free extent.
    pub fn largest_free_extent(&self) -> u64 {
        self.free_by_size
            .iter()
            .next_back()
            .map(|&(len, _)| len)
            .unwrap_or(0)
    }

    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}
