//! Bounded key to bytes map: the storage node's block memory.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store full: {needed} bytes needed, {available} available")]
    Full { needed: u64, available: u64 },
}

#[derive(Debug, Default)]
struct StoreInner {
    blocks: HashMap<String, Bytes>,
    used_bytes: u64,
}

/// Key → bytes map with an optional byte ceiling (`0` = unbounded).
#[derive(Debug, Default)]
pub struct BlockStore {
    inner: RwLock<StoreInner>,
    max_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub blocks: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl BlockStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            max_bytes,
        }
    }

    /// Insert or replace `key`. A replacement only needs room for the
    /// difference in size.
    pub fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let previous = inner.blocks.get(key).map_or(0, |b| b.len() as u64);
        let new_used = inner.used_bytes - previous + data.len() as u64;
        if self.max_bytes > 0 && new_used > self.max_bytes {
            return Err(StoreError::Full {
                needed: data.len() as u64,
                available: self.max_bytes - (inner.used_bytes - previous),
            });
        }
        inner.used_bytes = new_used;
        inner.blocks.insert(key.to_string(), data);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.read().blocks.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().blocks.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.write();
        let removed = inner.blocks.remove(key)?;
        inner.used_bytes -= removed.len() as u64;
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            blocks: inner.blocks.len(),
            used_bytes: inner.used_bytes,
            max_bytes: self.max_bytes,
        }
    }
}
