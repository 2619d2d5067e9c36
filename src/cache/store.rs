//! On-disk cache store.
//!
//! Layout: a JSON index at the cache root, payloads at
//! `<root>/<k[0:2]>/<k>` where `k` is the hex key. Payloads are written
//! to a temp file and renamed into place, so concurrent readers never
//! see a partial object.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use super::index::{now_millis, CacheEntry, CacheIndex, INDEX_FILE};
use super::key::CompileKey;
use crate::core::CacheError;
use crate::{debug, log};

/// Eviction drains to this fraction of `max_size`.
const LOW_WATER_RATIO: f64 = 0.8;

/// Windows device names that must never appear as a path component.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

struct State {
    index: CacheIndex,
    total_size: u64,
}

/// Content-addressed object cache with a size bound and TTL.
///
/// One reader/writer lock serializes index access; `get`/`put` on the
/// same store are safe from any number of threads.
pub struct ObjectCache {
    root: PathBuf,
    max_size: u64,
    ttl: Duration,
    state: RwLock<State>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl ObjectCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// An unreadable index is not fatal: the cache starts empty and
    /// logs a warning. Dangling entries (payload gone) are evicted on
    /// first access instead of at load time.
    pub fn open(root: impl Into<PathBuf>, max_size: u64, ttl: Duration) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::Io(root.clone(), e))?;

        let index = load_index(&root);
        let total_size = index.entries.values().map(|e| e.size).sum();

        Ok(Self {
            root,
            max_size,
            ttl,
            state: RwLock::new(State { index, total_size }),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        })
    }

    /// Look up the object bytes for `key`.
    ///
    /// Expired and dangling entries are evicted and report a miss.
    /// A hit refreshes last-accessed and bumps the hit counter.
    pub fn get(&self, key: &CompileKey) -> Option<Vec<u8>> {
        let hex = key.to_hex();
        let mut state = self.state.write();

        let Some(entry) = state.index.entries.get(&hex) else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = now_millis();
        let age = Duration::from_millis(now.saturating_sub(entry.created_at));
        if age > self.ttl {
            debug!("cache"; "expired: {key}");
            self.evict_entry(&mut state, &hex);
            self.persist_index(&state);
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let path = payload_path(&self.root, &hex);
        match fs::read(&path) {
            Ok(bytes) => {
                if let Some(entry) = state.index.entries.get_mut(&hex) {
                    entry.last_accessed = now;
                    entry.hits += 1;
                }
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Err(_) => {
                // Payload lost out from under the index; drop the entry.
                log!("cache"; "payload missing for {key}, evicting");
                self.evict_entry(&mut state, &hex);
                self.persist_index(&state);
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `bytes` under `key`, replacing any prior entry.
    pub fn put(&self, key: &CompileKey, bytes: &[u8]) -> Result<(), CacheError> {
        let hex = key.to_hex();
        validate_key(&hex)?;

        let shard_dir = self.root.join(&hex[..2]);
        fs::create_dir_all(&shard_dir).map_err(|e| CacheError::Io(shard_dir.clone(), e))?;
        let path = payload_path(&self.root, &hex);

        // Atomic write: temp file in the shard dir, then rename. A
        // failed write drops the temp file and leaves the index alone.
        let mut tmp =
            NamedTempFile::new_in(&shard_dir).map_err(|e| CacheError::Io(shard_dir.clone(), e))?;
        tmp.write_all(bytes).map_err(|e| CacheError::Io(path.clone(), e))?;
        tmp.persist(&path)
            .map_err(|e| CacheError::Io(path.clone(), e.error))?;

        let now = now_millis();
        let size = bytes.len() as u64;

        let mut state = self.state.write();
        let seq = state.index.next_seq;
        state.index.next_seq += 1;

        let old_size = state
            .index
            .entries
            .insert(
                hex,
                CacheEntry { size, created_at: now, last_accessed: now, hits: 0, seq },
            )
            .map(|old| old.size)
            .unwrap_or(0);
        state.total_size = state.total_size + size - old_size;

        self.evict_to_low_water(&mut state);
        self.persist_index(&state);
        Ok(())
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &CompileKey) -> bool {
        let hex = key.to_hex();
        let mut state = self.state.write();
        let existed = state.index.entries.contains_key(&hex);
        if existed {
            self.evict_entry(&mut state, &hex);
            self.persist_index(&state);
        }
        existed
    }

    /// Drop every entry and payload.
    pub fn clear(&self) {
        let mut state = self.state.write();
        let keys: Vec<String> = state.index.entries.keys().cloned().collect();
        for hex in keys {
            self.evict_entry(&mut state, &hex);
        }
        self.persist_index(&state);
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            entries: state.index.entries.len(),
            total_size: state.total_size,
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Internals (caller holds the write lock)
    // ------------------------------------------------------------------

    /// Remove an entry and its payload file.
    fn evict_entry(&self, state: &mut State, hex: &str) {
        if let Some(entry) = state.index.entries.remove(hex) {
            state.total_size = state.total_size.saturating_sub(entry.size);
            let _ = fs::remove_file(payload_path(&self.root, hex));
        }
    }

    /// Evict by ascending last-accessed (ties by registration order)
    /// until the total is at or below the low-water mark.
    fn evict_to_low_water(&self, state: &mut State) {
        if state.total_size <= self.max_size {
            return;
        }
        let low_water = (self.max_size as f64 * LOW_WATER_RATIO) as u64;

        let mut order: Vec<(String, u64, u64)> = state
            .index
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.seq))
            .collect();
        order.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        for (hex, _, _) in order {
            if state.total_size <= low_water {
                break;
            }
            debug!("cache"; "evicting {} for size", &hex[..16]);
            self.evict_entry(state, &hex);
        }
    }

    /// Write the index out. Failure is reported but not rolled back;
    /// the next startup tolerates a stale or corrupt index.
    fn persist_index(&self, state: &State) {
        let path = self.root.join(INDEX_FILE);
        let result = serde_json::to_vec(&state.index)
            .map_err(CacheError::Index)
            .and_then(|json| {
                let mut tmp = NamedTempFile::new_in(&self.root)
                    .map_err(|e| CacheError::Io(self.root.clone(), e))?;
                tmp.write_all(&json).map_err(|e| CacheError::Io(path.clone(), e))?;
                tmp.persist(&path).map_err(|e| CacheError::Io(path.clone(), e.error))?;
                Ok(())
            });
        if let Err(e) = result {
            log!("cache"; "index persist failed: {e}");
        }
    }
}

/// Reject keys that would produce hostile or colliding paths.
///
/// Keys are hex in practice; anything else (empty, path separators,
/// Windows device names from a hand-edited index) is refused rather
/// than silently mangled.
fn validate_key(hex: &str) -> Result<(), CacheError> {
    if hex.is_empty() {
        return Err(CacheError::InvalidKey("empty key".into()));
    }
    if hex.len() < 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(CacheError::InvalidKey(format!("non-hex key `{hex}`")));
    }
    let lower = hex.to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lower.as_str()) || RESERVED_NAMES.contains(&&lower[..2]) {
        return Err(CacheError::InvalidKey(format!("reserved name `{hex}`")));
    }
    Ok(())
}

fn payload_path(root: &Path, hex: &str) -> PathBuf {
    root.join(&hex[..2]).join(hex)
}

/// Load the index, tolerating absence and corruption.
fn load_index(root: &Path) -> CacheIndex {
    let path = root.join(INDEX_FILE);
    let Ok(bytes) = fs::read(&path) else {
        return CacheIndex::new();
    };
    match serde_json::from_slice::<CacheIndex>(&bytes) {
        Ok(mut index) => {
            // Drop entries whose keys would not survive validation.
            index.entries.retain(|k, _| validate_key(k).is_ok());
            index
        }
        Err(e) => {
            log!("cache"; "index unreadable ({e}), starting empty");
            CacheIndex::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Arch;
    use tempfile::TempDir;

    fn key(n: u8) -> CompileKey {
        CompileKey::compute("gcc", "1", Arch::X86_64, &[], &[], &[n])
    }

    fn open(dir: &TempDir, max: u64) -> ObjectCache {
        ObjectCache::open(dir.path(), max, Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key(1);

        assert!(cache.get(&k).is_none());
        cache.put(&k, b"object bytes").unwrap();
        assert_eq!(cache.get(&k).unwrap(), b"object bytes");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_replace_updates_size() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key(2);

        cache.put(&k, &[0u8; 100]).unwrap();
        cache.put(&k, &[0u8; 40]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size, 40);
    }

    #[test]
    fn test_eviction_respects_low_water() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1000);

        // Seven 150-byte payloads; the seventh put crosses the
        // 1000-byte bound and triggers an eviction pass.
        for n in 0..7u8 {
            cache.put(&key(n), &[n; 150]).unwrap();
        }

        let stats = cache.stats();
        assert!(stats.total_size <= 800, "post-eviction total {} above low water", stats.total_size);
        // Oldest entries went first.
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(6)).is_some());
    }

    #[test]
    fn test_size_never_exceeds_bound() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1000);

        for n in 0..25u8 {
            cache.put(&key(n), &[n; 90]).unwrap();
            assert!(cache.stats().total_size <= 1000);
        }
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = ObjectCache::open(dir.path(), 1 << 20, Duration::ZERO).unwrap();
        let k = key(3);

        cache.put(&k, b"stale soon").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_dangling_payload_evicted() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key(4);

        cache.put(&k, b"bytes").unwrap();
        fs::remove_file(payload_path(dir.path(), &k.to_hex())).unwrap();

        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);

        cache.put(&key(5), b"a").unwrap();
        cache.put(&key(6), b"b").unwrap();
        assert!(cache.delete(&key(5)));
        assert!(!cache.delete(&key(5)));

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_size, 0);
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir, 1 << 20);
            cache.put(&key(7), b"persisted").unwrap();
        }
        fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();

        let cache = open(&dir, 1 << 20);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let k = key(8);
        {
            let cache = open(&dir, 1 << 20);
            cache.put(&k, b"durable").unwrap();
        }
        let cache = open(&dir, 1 << 20);
        assert_eq!(cache.get(&k).unwrap(), b"durable");
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("").is_err());
        assert!(validate_key("con").is_err());
        assert!(validate_key("nul").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("ab/cd").is_err());
        assert!(validate_key("deadbeef").is_ok());
    }
}
