//! Byte-addressable memory regions the transfer handler copies between.
//!
//! [`DeviceMemory`] stands in for device HBM when no accelerator runtime is
//! linked: one flat region per device, addressed by `BlockReference`.
//! [`HostPool`] is the pinned host region backing the L1 tier, addressed by
//! `AllocationPointer`.

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use crate::cache::block::{AllocationPointer, BlockReference};
use crate::transfer::handler::TransferError;

fn checked_range(address: u64, len: u64, limit: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(address).ok()?;
    let len = usize::try_from(len).ok()?;
    let end = start.checked_add(len)?;
    (end <= limit).then_some(start..end)
}

/// Simulated device memory, one region per device.
pub struct DeviceMemory {
    devices: Vec<RwLock<Vec<u8>>>,
    bytes_per_device: usize,
}

impl DeviceMemory {
    pub fn new(device_count: usize, bytes_per_device: usize) -> Self {
        let devices = (0..device_count)
            .map(|_| RwLock::new(vec![0u8; bytes_per_device]))
            .collect();
        info!(
            devices = device_count,
            bytes_per_device, "Simulated device memory initialized"
        );
        Self {
            devices,
            bytes_per_device,
        }
    }

    fn region(&self, device_id: usize) -> Result<&RwLock<Vec<u8>>, TransferError> {
        self.devices
            .get(device_id)
            .ok_or(TransferError::DeviceNotAvailable(device_id))
    }

    /// Copy the referenced block out of device memory.
    pub fn read(&self, block: &BlockReference) -> Result<Bytes, TransferError> {
        let region = self.region(block.device_id)?;
        let range = checked_range(
            block.device_memory_address,
            block.size_bytes,
            self.bytes_per_device,
        )
        .ok_or(TransferError::DeviceOutOfBounds {
            device_id: block.device_id,
            address: block.device_memory_address,
            size: block.size_bytes,
        })?;
        let mem = region.read();
        Ok(Bytes::copy_from_slice(&mem[range]))
    }

    /// Write `data` at the referenced device location.
    ///
    /// `data` may be shorter than the reference; it may not be longer.
    pub fn write(&self, block: &BlockReference, data: &[u8]) -> Result<(), TransferError> {
        if data.len() as u64 > block.size_bytes {
            return Err(TransferError::BufferTooSmall {
                needed: data.len() as u64,
                available: block.size_bytes,
            });
        }
        let region = self.region(block.device_id)?;
        let range = checked_range(
            block.device_memory_address,
            data.len() as u64,
            self.bytes_per_device,
        )
        .ok_or(TransferError::DeviceOutOfBounds {
            device_id: block.device_id,
            address: block.device_memory_address,
            size: data.len() as u64,
        })?;
        let mut mem = region.write();
        mem[range].copy_from_slice(data);
        Ok(())
    }
}

/// Pinned host memory backing the L1 tier.
pub struct HostPool {
    bytes: RwLock<Vec<u8>>,
}

impl HostPool {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; capacity_bytes]),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn read(&self, pointer: &AllocationPointer) -> Result<Bytes, TransferError> {
        let mem = self.bytes.read();
        let range = checked_range(pointer.host_address, pointer.size_bytes, mem.len())
            .ok_or(TransferError::HostOutOfBounds {
                address: pointer.host_address,
                size: pointer.size_bytes,
            })?;
        Ok(Bytes::copy_from_slice(&mem[range]))
    }

    pub fn write(&self, pointer: &AllocationPointer, data: &[u8]) -> Result<(), TransferError> {
        if data.len() as u64 != pointer.size_bytes {
            return Err(TransferError::SizeMismatch {
                expected: pointer.size_bytes,
                actual: data.len() as u64,
            });
        }
        let mut mem = self.bytes.write();
        let range = checked_range(pointer.host_address, pointer.size_bytes, mem.len())
            .ok_or(TransferError::HostOutOfBounds {
                address: pointer.host_address,
                size: pointer.size_bytes,
            })?;
        mem[range].copy_from_slice(data);
        Ok(())
    }
}
