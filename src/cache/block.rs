//! Block identity and location types.
//!
//! A block is the unit of movement between device memory, the L1 host pool and
//! the L2 storage fleet. It is addressed by a content-derived [`CacheKey`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, immutable identifier derived from a token-prefix content hash.
///
/// Cloning is cheap: the key text is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0.to_string()
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Describes where a block lives in device (GPU) memory.
///
/// Produced by the inference engine for the duration of a call; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReference {
    /// Device index.
    pub device_id: usize,

    /// Byte address within the device's memory.
    pub device_memory_address: u64,

    /// Size of the block in bytes.
    pub size_bytes: u64,
}

impl BlockReference {
    pub fn new(device_id: usize, device_memory_address: u64, size_bytes: u64) -> Self {
        Self {
            device_id,
            device_memory_address,
            size_bytes,
        }
    }

    /// Same device location, narrowed to `size_bytes`.
    pub fn with_size(&self, size_bytes: u64) -> Self {
        Self {
            size_bytes,
            ..*self
        }
    }
}

/// A live reservation inside the L1 host pool.
///
/// Created by a successful allocation and destroyed by `free`; never resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationPointer {
    /// Offset of the reservation within the pinned host pool.
    pub host_address: u64,

    /// Size of the reservation in bytes.
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_clone_shares_text() {
        let key = CacheKey::new("prefix-0badf00d");
        let copy = key.clone();
        assert_eq!(key, copy);
        assert_eq!(copy.as_str(), "prefix-0badf00d");
    }

    #[test]
    fn test_cache_key_serializes_as_string() {
        let key = CacheKey::from("abc");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"abc\"");
        let back: CacheKey = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_block_reference_with_size() {
        let block = BlockReference::new(1, 4096, 1024);
        let narrowed = block.with_size(100);
        assert_eq!(narrowed.device_id, 1);
        assert_eq!(narrowed.device_memory_address, 4096);
        assert_eq!(narrowed.size_bytes, 100);
    }
}
