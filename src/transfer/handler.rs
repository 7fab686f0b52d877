//! Device ↔ host transfer handler.
//!
//! Moves bytes between device memory and the L1 host pool. No policy lives
//! here: callers decide what to move and handle failures. Every copy is timed
//! and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::block::{AllocationPointer, BlockReference};
use crate::transfer::device::{DeviceMemory, HostPool};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Device {0} not available")]
    DeviceNotAvailable(usize),

    #[error("Device {device_id} range {address:#x}+{size} out of bounds")]
    DeviceOutOfBounds { device_id: usize, address: u64, size: u64 },

    #[error("Host pool range {address:#x}+{size} out of bounds")]
    HostOutOfBounds { address: u64, size: u64 },

    #[error("Transfer buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: u64, available: u64 },

    #[error("Transfer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Copy engine error: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device to Host (GPU → RAM).
    DeviceToHost,
    /// Host to Device (RAM → GPU).
    HostToDevice,
}

/// Outcome of a completed copy.
#[derive(Debug, Clone, Copy)]
pub struct TransferReport {
    pub direction: TransferDirection,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Copy primitives between device memory and the L1 host pool.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    /// Copy a device block into an L1 reservation of the same size.
    async fn device_to_host(
        &self,
        src: &BlockReference,
        dst: &AllocationPointer,
    ) -> Result<TransferReport, TransferError>;

    /// Copy an L1 reservation into device memory. `dst` must be large enough.
    async fn host_to_device(
        &self,
        src: &AllocationPointer,
        dst: &BlockReference,
    ) -> Result<TransferReport, TransferError>;

    /// Read a device block into a transfer buffer (used for the L2 path).
    async fn read_device(&self, src: &BlockReference) -> Result<Bytes, TransferError>;

    /// Write a transfer buffer into device memory (used for the L2 path).
    async fn write_device(
        &self,
        dst: &BlockReference,
        data: &[u8],
    ) -> Result<TransferReport, TransferError>;

    /// Read an L1 reservation into a transfer buffer.
    async fn read_host(&self, src: &AllocationPointer) -> Result<Bytes, TransferError>;

    fn stats(&self) -> TransferStatsSnapshot;
}

#[derive(Debug, Default)]
pub struct TransferStats {
    total_d2h_bytes: AtomicU64,
    total_h2d_bytes: AtomicU64,
    total_d2h_transfers: AtomicU64,
    total_h2d_transfers: AtomicU64,
    total_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransferStatsSnapshot {
    pub total_d2h_bytes: u64,
    pub total_h2d_bytes: u64,
    pub total_d2h_transfers: u64,
    pub total_h2d_transfers: u64,
    pub total_failures: u64,
}

impl TransferStats {
    pub fn record(&self, direction: TransferDirection, bytes: u64) {
        let (b, n) = match direction {
            TransferDirection::DeviceToHost => (&self.total_d2h_bytes, &self.total_d2h_transfers),
            TransferDirection::HostToDevice => (&self.total_h2d_bytes, &self.total_h2d_transfers),
        };
        b.fetch_add(bytes, Ordering::Relaxed);
        n.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            total_d2h_bytes: self.total_d2h_bytes.load(Ordering::Relaxed),
            total_h2d_bytes: self.total_h2d_bytes.load(Ordering::Relaxed),
            total_d2h_transfers: self.total_d2h_transfers.load(Ordering::Relaxed),
            total_h2d_transfers: self.total_h2d_transfers.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

/// Transfer handler over host-resident memory regions.
///
/// Without an accelerator runtime the "device" side is [`DeviceMemory`];
/// `copy_latency` models the DMA round trip.
pub struct HostTransferHandler {
    devices: Arc<DeviceMemory>,
    pool: Arc<HostPool>,
    copy_latency: Duration,
    stats: TransferStats,
}

impl HostTransferHandler {
    pub fn new(devices: Arc<DeviceMemory>, pool: Arc<HostPool>) -> Self {
        Self {
            devices,
            pool,
            copy_latency: Duration::ZERO,
            stats: TransferStats::default(),
        }
    }

    pub fn with_copy_latency(mut self, latency: Duration) -> Self {
        self.copy_latency = latency;
        self
    }

    pub fn devices(&self) -> &Arc<DeviceMemory> {
        &self.devices
    }

    async fn dma_wait(&self) {
        if !self.copy_latency.is_zero() {
            tokio::time::sleep(self.copy_latency).await;
        }
    }

    fn finish(
        &self,
        direction: TransferDirection,
        bytes: u64,
        started: Instant,
        result: Result<(), TransferError>,
    ) -> Result<TransferReport, TransferError> {
        match result {
            Ok(()) => {
                self.stats.record(direction, bytes);
                let report = TransferReport {
                    direction,
                    bytes,
                    elapsed: started.elapsed(),
                };
                debug!(
                    direction = ?report.direction,
                    bytes = report.bytes,
                    elapsed_us = report.elapsed.as_micros() as u64,
                    "Transfer complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TransferHandler for HostTransferHandler {
    async fn device_to_host(
        &self,
        src: &BlockReference,
        dst: &AllocationPointer,
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        let result = async {
            if src.size_bytes != dst.size_bytes {
                return Err(TransferError::SizeMismatch {
                    expected: dst.size_bytes,
                    actual: src.size_bytes,
                });
            }
            let data = self.devices.read(src)?;
            self.dma_wait().await;
            self.pool.write(dst, &data)
        }
        .await;
        self.finish(TransferDirection::DeviceToHost, src.size_bytes, started, result)
    }

    async fn host_to_device(
        &self,
        src: &AllocationPointer,
        dst: &BlockReference,
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        let result = async {
            let data = self.pool.read(src)?;
            self.dma_wait().await;
            self.devices.write(dst, &data)
        }
        .await;
        self.finish(TransferDirection::HostToDevice, src.size_bytes, started, result)
    }

    async fn read_device(&self, src: &BlockReference) -> Result<Bytes, TransferError> {
        let started = Instant::now();
        let data = match self.devices.read(src) {
            Ok(data) => data,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };
        self.dma_wait().await;
        self.finish(TransferDirection::DeviceToHost, src.size_bytes, started, Ok(()))?;
        Ok(data)
    }

    async fn write_device(
        &self,
        dst: &BlockReference,
        data: &[u8],
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        self.dma_wait().await;
        let result = self.devices.write(dst, data);
        self.finish(TransferDirection::HostToDevice, data.len() as u64, started, result)
    }

    async fn read_host(&self, src: &AllocationPointer) -> Result<Bytes, TransferError> {
        self.pool.read(src)
    }

    fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> HostTransferHandler {
        HostTransferHandler::new(
            Arc::new(DeviceMemory::new(2, 64 * 1024)),
            Arc::new(HostPool::new(16 * 1024)),
        )
    }

    #[tokio::test]
    async fn test_d2h_then_h2d() {
        let engine = handler();
        let src = BlockReference::new(0, 0, 4096);
        engine.devices().write(&src, &vec![42u8; 4096]).unwrap();

        let ptr = AllocationPointer {
            host_address: 1024,
            size_bytes: 4096,
        };
        engine.device_to_host(&src, &ptr).await.unwrap();

        let dst = BlockReference::new(1, 8192, 4096);
        engine.host_to_device(&ptr, &dst).await.unwrap();
        assert_eq!(engine.devices().read(&dst).unwrap(), vec![42u8; 4096]);

        let stats = engine.stats();
        assert_eq!(stats.total_d2h_transfers, 1);
        assert_eq!(stats.total_h2d_transfers, 1);
        assert_eq!(stats.total_h2d_bytes, 4096);
    }

    #[tokio::test]
    async fn test_invalid_device() {
        let engine = handler();
        let ptr = AllocationPointer {
            host_address: 0,
            size_bytes: 1024,
        };
        let result = engine
            .device_to_host(&BlockReference::new(5, 0, 1024), &ptr)
            .await;
        assert_eq!(result.unwrap_err(), TransferError::DeviceNotAvailable(5));
        assert_eq!(engine.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn test_h2d_destination_too_small() {
        let engine = handler();
        let ptr = AllocationPointer {
            host_address: 0,
            size_bytes: 2048,
        };
        let result = engine
            .host_to_device(&ptr, &BlockReference::new(0, 0, 1024))
            .await;
        assert!(matches!(result, Err(TransferError::BufferTooSmall { .. })));
    }
}
