//! Cache index data structures.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Index file name
pub const INDEX_FILE: &str = "index.json";

/// Metadata for one cached object file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Payload size in bytes
    pub size: u64,
    /// Creation time (Unix timestamp in milliseconds)
    pub created_at: u64,
    /// Last access time (Unix timestamp in milliseconds)
    #[serde(default)]
    pub last_accessed: u64,
    /// Hit counter
    #[serde(default)]
    pub hits: u64,
    /// Registration order, breaks last-accessed ties during eviction
    #[serde(default)]
    pub seq: u64,
}

/// Index mapping hex compile keys to entry metadata
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    /// Hex key -> entry metadata
    pub entries: FxHashMap<String, CacheEntry>,
    /// Index creation time (Unix timestamp in milliseconds)
    #[serde(default)]
    pub created_at: u64,
    /// Next registration sequence number
    #[serde(default)]
    pub next_seq: u64,
}

impl CacheIndex {
    /// Create a new index with current timestamp.
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            created_at: now_millis(),
            next_seq: 0,
        }
    }
}

/// Current Unix timestamp in milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
