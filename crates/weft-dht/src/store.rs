//! In-memory value store with TTL expiry and last-write-wins merge.
//!
//! Entries are keyed by the 256-bit key id. A write only lands when its
//! record is strictly newer than what is held (by the `(ts, publisher)`
//! order), so replicas converge on the same winner regardless of arrival
//! order. `publisher` marks records this node authored; only those are
//! republished and repaired.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use weft_types::id::NodeId;
use weft_types::record::Record;

/// A stored record plus its local bookkeeping.
#[derive(Clone, Debug)]
pub struct StoreEntry {
    /// The record itself.
    pub record: Record,
    /// When this entry stops being served.
    pub expires_at: Instant,
    /// Whether this node authored the record (and republishes it).
    pub publisher: bool,
    /// Last time the repair task walked this entry.
    pub last_repair: Option<Instant>,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The local record map.
pub struct ValueStore {
    entries: HashMap<NodeId, StoreEntry>,
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get the entry under `key` if present and unexpired.
    pub fn get(&self, key: &NodeId) -> Option<&StoreEntry> {
        self.entries.get(key).filter(|e| !e.is_expired())
    }

    /// Get the record under `key` if present and unexpired.
    pub fn get_record(&self, key: &NodeId) -> Option<&Record> {
        self.get(key).map(|e| &e.record)
    }

    /// Whether an unexpired entry exists under `key`.
    pub fn contains(&self, key: &NodeId) -> bool {
        self.get(key).is_some()
    }

    /// Store a received or cached record unless the held one is as new.
    ///
    /// Returns whether the record landed. A landing record always resets
    /// the entry to `publisher = false`: replication never makes this
    /// node an author, and a publisher entry beaten by a strictly newer
    /// record stops being republished from here.
    pub fn upsert_if_newer(&mut self, key: NodeId, record: Record, ttl: Duration) -> bool {
        if let Some(existing) = self.entries.get(&key) {
            if !existing.is_expired() && !record.is_newer_than(&existing.record) {
                return false;
            }
        }
        self.entries.insert(
            key,
            StoreEntry {
                record,
                expires_at: Instant::now() + ttl,
                publisher: false,
                last_repair: None,
            },
        );
        true
    }

    /// Store a record this node authored, after its quorum was met.
    pub fn insert_published(&mut self, key: NodeId, record: Record, ttl: Duration) {
        self.entries.insert(
            key,
            StoreEntry {
                record,
                expires_at: Instant::now() + ttl,
                publisher: true,
                last_repair: None,
            },
        );
    }

    /// Note a repair pass over `key`.
    pub fn mark_repaired(&mut self, key: &NodeId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_repair = Some(Instant::now());
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn reap_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "expired records reaped");
        }
        removed
    }

    /// Keys of unexpired entries this node authored.
    pub fn publisher_keys(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.publisher && !e.is_expired())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Keys of all unexpired entries.
    pub fn keys(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_expired()).count()
    }

    /// Whether no unexpired entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn record(ts: u64, publisher: &str) -> Record {
        Record {
            data: format!("v{ts}").into_bytes(),
            ts,
            publisher: publisher.to_string(),
        }
    }

    #[test]
    fn test_put_get() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        assert!(store.upsert_if_newer(key, record(1, "aa"), TTL));
        assert_eq!(store.get_record(&key), Some(&record(1, "aa")));
        assert_eq!(store.len(), 1);
        assert!(store.get(&[2u8; 32]).is_none());
    }

    #[test]
    fn test_newer_record_wins() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        store.upsert_if_newer(key, record(5, "aa"), TTL);

        // Older and equal writes bounce.
        assert!(!store.upsert_if_newer(key, record(4, "ff"), TTL));
        assert!(!store.upsert_if_newer(key, record(5, "aa"), TTL));

        // Same ts, larger publisher wins.
        assert!(store.upsert_if_newer(key, record(5, "bb"), TTL));
        assert_eq!(store.get_record(&key), Some(&record(5, "bb")));
    }

    #[test]
    fn test_replication_clears_publisher_flag() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        store.insert_published(key, record(5, "aa"), TTL);
        assert_eq!(store.publisher_keys(), vec![key]);

        // A strictly newer replica write takes over authorship elsewhere.
        assert!(store.upsert_if_newer(key, record(6, "bb"), TTL));
        assert!(store.publisher_keys().is_empty());
        assert_eq!(store.get_record(&key), Some(&record(6, "bb")));
    }

    #[test]
    fn test_expiry_hides_and_reaps() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        store.upsert_if_newer(key, record(1, "aa"), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));

        assert!(store.get(&key).is_none());
        assert!(!store.contains(&key));
        assert!(store.is_empty());
        assert_eq!(store.reap_expired(), 1);
    }

    #[test]
    fn test_expired_entry_accepts_older_record() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        store.upsert_if_newer(key, record(9, "ff"), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));

        // The held record is expired; even an "older" one may land.
        assert!(store.upsert_if_newer(key, record(3, "aa"), TTL));
        assert_eq!(store.get_record(&key), Some(&record(3, "aa")));
    }

    #[test]
    fn test_mark_repaired() {
        let mut store = ValueStore::new();
        let key = [1u8; 32];
        store.insert_published(key, record(1, "aa"), TTL);
        assert!(store.get(&key).and_then(|e| e.last_repair).is_none());
        store.mark_repaired(&key);
        assert!(store.get(&key).and_then(|e| e.last_repair).is_some());
    }

    #[test]
    fn test_keys_listing() {
        let mut store = ValueStore::new();
        store.upsert_if_newer([1u8; 32], record(1, "aa"), TTL);
        store.insert_published([2u8; 32], record(1, "bb"), TTL);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec![[1u8; 32], [2u8; 32]]);
        assert_eq!(store.publisher_keys(), vec![[2u8; 32]]);
    }
}
