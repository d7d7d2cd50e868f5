//! Cache of what is already in the object store for this node.
//!
//! SSTables are immutable, so a key that exists remotely does not need to
//! be shipped again; the source size is cross-checked whenever it is
//! known. A bare prefix listing only reveals remote (compressed) sizes,
//! so source sizes are filled in from the newest manifest and from
//! uploads this process performs.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::manifest::Manifest;
use crate::storage::{scan_prefix, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Size of the stored object (compressed bytes).
    pub remote_size: u64,
    /// Size of the source file, when a manifest or an upload recorded it.
    pub source_size: Option<u64>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct UploadFingerprintCache {
    inner: RwLock<HashMap<String, Fingerprint>>,
}

impl UploadFingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime the cache by listing everything under the node's key prefix.
    pub fn populate(&self, store: &dyn ObjectStore, token_prefix: &str) -> Result<usize> {
        let mut map = HashMap::new();
        for object in scan_prefix(store, token_prefix) {
            let object = object?;
            map.insert(
                object.key,
                Fingerprint {
                    remote_size: object.size,
                    source_size: None,
                    uploaded_at: object.mod_time,
                },
            );
        }
        let count = map.len();
        *self.inner.write().unwrap() = map;
        tracing::info!(prefix = token_prefix, objects = count, "fingerprint cache primed");
        Ok(count)
    }

    /// Fill in source sizes from a manifest's per-entry metadata.
    pub fn overlay_manifest(&self, manifest: &Manifest) {
        if !manifest.has_sizes() {
            return;
        }
        let mut map = self.inner.write().unwrap();
        for entry in &manifest.entries {
            if let Some(fp) = map.get_mut(&entry.remote_key) {
                fp.source_size = Some(entry.size);
            }
        }
    }

    /// True when the store already holds `remote_key` for a source file of
    /// `source_size` bytes. When only the listing primed the entry, the
    /// key's presence decides; immutable files cannot silently differ.
    pub fn holds_same_size(&self, remote_key: &str, source_size: u64) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(remote_key)
            .is_some_and(|fp| fp.source_size.is_none_or(|s| s == source_size))
    }

    /// Stored object size for `remote_key`, if known.
    pub fn remote_size_of(&self, remote_key: &str) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .get(remote_key)
            .map(|fp| fp.remote_size)
    }

    /// Record a completed upload.
    pub fn record(
        &self,
        remote_key: &str,
        source_size: u64,
        remote_size: u64,
        uploaded_at: DateTime<Utc>,
    ) {
        self.inner.write().unwrap().insert(
            remote_key.to_string(),
            Fingerprint {
                remote_size,
                source_size: Some(source_size),
                uploaded_at: Some(uploaded_at),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    #[test]
    fn populate_reads_sizes_from_listing() {
        let store = MemoryStore::new();
        store.put_bytes("b/p/tseT/100/x", &[0u8; 10]);
        store.put_bytes("b/p/tseT/100/y", &[0u8; 20]);
        store.put_bytes("b/p/tseT/200/other-token", &[0u8; 5]);

        let cache = UploadFingerprintCache::new();
        assert_eq!(cache.populate(&store, "b/p/tseT/100/").unwrap(), 2);
        // Listing alone cannot know source sizes; presence decides.
        assert!(cache.holds_same_size("b/p/tseT/100/x", 999));
        assert_eq!(cache.remote_size_of("b/p/tseT/100/x"), Some(10));
        assert!(!cache.holds_same_size("b/p/tseT/200/other-token", 5));
    }

    #[test]
    fn recorded_uploads_check_source_size() {
        let cache = UploadFingerprintCache::new();
        cache.record("k", 1024, 300, Utc::now());
        assert!(cache.holds_same_size("k", 1024));
        assert!(!cache.holds_same_size("k", 1025));
        assert_eq!(cache.remote_size_of("k"), Some(300));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unknown_key_is_never_held() {
        let cache = UploadFingerprintCache::new();
        assert!(!cache.holds_same_size("missing", 1));
        assert!(cache.is_empty());
    }
}
