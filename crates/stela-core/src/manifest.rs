//! Per-round manifests: the self-describing record of what a backup round
//! shipped, and the round's commit marker. A round without a manifest
//! never happened as far as restore is concerned.
//!
//! Two dialects exist in the wild. v2 is a JSON document with per-file
//! metadata under `META/<instant>/manifest.json`; v1 is a flat JSON array
//! of remote keys at `META/<instant>-meta.json`, written by deployments
//! that predate per-file metadata. The reader accepts both and normalizes
//! to the v2 shape.

use std::io::{Cursor, Read};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backup_path::{BackupFileType, BackupPath, KeyScheme};
use crate::compress::Codec;
use crate::error::{Result, StelaError};
use crate::storage::{scan_prefix, ObjectStore, StoreError};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// One backed-up file. Ordering within a manifest is by remote key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub keyspace: String,
    pub column_family: Option<String>,
    pub file_name: String,
    pub remote_key: String,
    /// Uncompressed bytes; zero for entries normalized from v1 manifests.
    pub size: u64,
    pub compressed_size: u64,
    /// Hex SHA-256 of the uncompressed file; empty for v1 entries.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub cluster_name: String,
    pub token: String,
    pub instant: DateTime<Utc>,
    /// Fingerprint of the (keyspace, column family) set in this round.
    pub schema_hash: String,
    /// Codec the round's data files were written with.
    pub compression: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn codec(&self) -> Result<Codec> {
        Codec::from_config(&self.compression)
            .map_err(|_| StelaError::ManifestBroken(format!(
                "manifest names unknown codec '{}'",
                self.compression
            )))
    }

    /// True when per-entry sizes can be trusted for same-size skips.
    pub fn has_sizes(&self) -> bool {
        self.version >= 2
    }
}

/// Accumulates entries as uploads complete; workers append concurrently.
pub struct ManifestBuilder {
    cluster_name: String,
    token: String,
    instant: DateTime<Utc>,
    compression: Codec,
    entries: Mutex<Vec<ManifestEntry>>,
}

impl ManifestBuilder {
    pub fn new(cluster_name: &str, token: &str, instant: DateTime<Utc>, compression: Codec) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            token: token.to_string(),
            instant,
            compression,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, path: &BackupPath, sha256: String) {
        self.entries.lock().unwrap().push(ManifestEntry {
            keyspace: path.keyspace.clone().unwrap_or_default(),
            column_family: path.column_family.clone(),
            file_name: path.file_name.clone(),
            remote_key: path.remote_key().to_string(),
            size: path.size,
            compressed_size: path.compressed_size,
            sha256,
        });
    }

    /// Append a pre-built entry (used for files skipped as already
    /// uploaded, whose metadata comes from the prior manifest).
    pub fn add_entry(&self, entry: ManifestEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Freeze into a manifest: entries sorted by remote key, schema hash
    /// derived from the sorted (keyspace, column family) set.
    pub fn finalize(self) -> Manifest {
        let mut entries = self.entries.into_inner().unwrap();
        entries.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));

        let mut pairs: Vec<String> = entries
            .iter()
            .map(|e| format!("{}/{}", e.keyspace, e.column_family.as_deref().unwrap_or("")))
            .collect();
        pairs.sort();
        pairs.dedup();
        let mut hasher = Sha256::new();
        for pair in &pairs {
            hasher.update(pair.as_bytes());
            hasher.update(b"\n");
        }
        let schema_hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        Manifest {
            version: 2,
            cluster_name: self.cluster_name,
            token: self.token,
            instant: self.instant,
            schema_hash,
            compression: self.compression.name().to_string(),
            entries,
        }
    }
}

/// Serialize and put the manifest; its appearance commits the round.
pub fn write_manifest(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    manifest: &Manifest,
) -> Result<String> {
    let key = scheme.meta_v2_key(&manifest.token, manifest.instant, MANIFEST_FILE_NAME);
    let body = serde_json::to_vec(manifest)?;
    let size = body.len() as u64;
    store
        .put(&key, &mut Cursor::new(body), size)
        .map_err(StelaError::from)?;
    tracing::info!(%key, entries = manifest.entries.len(), "manifest published");
    Ok(key)
}

/// A manifest object sitting in the store, not yet fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    pub key: String,
    pub instant: DateTime<Utc>,
    pub version: u32,
}

/// All manifests for a token, ordered by instant ascending.
pub fn list_manifests(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    token: &str,
    region: &str,
) -> Result<Vec<ManifestRef>> {
    let prefix = format!("{}/", scheme.meta_prefix(token));
    let mut refs = Vec::new();
    for object in scan_prefix(store, &prefix) {
        let object = object?;
        match BackupPath::decode(scheme, &object.key, region) {
            Ok(path) if path.file_type == BackupFileType::MetaV2 => refs.push(ManifestRef {
                key: object.key,
                instant: path.time,
                version: 2,
            }),
            Ok(path) if path.file_type == BackupFileType::Meta => refs.push(ManifestRef {
                key: object.key,
                instant: path.time,
                version: 1,
            }),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %object.key, "skipping unparseable meta key: {e}");
            }
        }
    }
    refs.sort_by(|a, b| a.instant.cmp(&b.instant).then(a.version.cmp(&b.version)));
    Ok(refs)
}

/// Newest manifest with `instant <= at`, fetched and normalized to v2.
pub fn find_at_or_before(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    token: &str,
    region: &str,
    at: DateTime<Utc>,
) -> Result<Option<(ManifestRef, Manifest)>> {
    let refs = list_manifests(store, scheme, token, region)?;
    let Some(chosen) = refs.into_iter().rev().find(|r| r.instant <= at) else {
        return Ok(None);
    };
    let manifest = fetch_manifest(store, scheme, region, &chosen)?;
    Ok(Some((chosen, manifest)))
}

fn fetch_manifest(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    region: &str,
    reference: &ManifestRef,
) -> Result<Manifest> {
    let mut reader = store.get(&reference.key).map_err(|e| match e {
        StoreError::NotFound(key) => {
            StelaError::ManifestBroken(format!("manifest vanished during read: {key}"))
        }
        other => StelaError::from(other),
    })?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;

    if reference.version >= 2 {
        let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| {
            StelaError::ManifestBroken(format!("cannot parse manifest {}: {e}", reference.key))
        })?;
        return Ok(manifest);
    }
    normalize_v1(scheme, region, reference, &body)
}

/// Lift a legacy flat key array into the v2 shape. Sizes and digests are
/// unknown, so `has_sizes()` is false and restore always overwrites.
fn normalize_v1(
    scheme: &KeyScheme,
    region: &str,
    reference: &ManifestRef,
    body: &[u8],
) -> Result<Manifest> {
    let keys: Vec<String> = serde_json::from_slice(body).map_err(|e| {
        StelaError::ManifestBroken(format!("cannot parse v1 manifest {}: {e}", reference.key))
    })?;
    let mut entries = Vec::with_capacity(keys.len());
    let mut cluster_name = String::new();
    let mut token = String::new();
    for key in keys {
        let path = BackupPath::decode(scheme, &key, region).map_err(|e| {
            StelaError::ManifestBroken(format!(
                "v1 manifest {} references malformed key: {e}",
                reference.key
            ))
        })?;
        cluster_name = path.cluster_name.clone();
        token = path.token.clone();
        entries.push(ManifestEntry {
            keyspace: path.keyspace.clone().unwrap_or_default(),
            column_family: path.column_family.clone(),
            file_name: path.file_name.clone(),
            remote_key: key,
            size: 0,
            compressed_size: 0,
            sha256: String::new(),
        });
    }
    entries.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
    Ok(Manifest {
        version: 1,
        cluster_name,
        token,
        instant: reference.instant,
        schema_hash: String::new(),
        // Deployments that wrote v1 manifests compressed with LZF.
        compression: Codec::Lzf.name().to_string(),
        entries,
    })
}

/// Delete manifests older than the retention window. Returns how many
/// were removed. Data objects are left to the store's lifecycle policy.
pub fn prune_expired(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    token: &str,
    region: &str,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let cutoff = now - Duration::days(retention_days as i64);
    let mut removed = 0;
    for reference in list_manifests(store, scheme, token, region)? {
        if reference.instant < cutoff {
            store.delete(&reference.key).map_err(StelaError::from)?;
            tracing::info!(key = %reference.key, "expired manifest pruned");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_path::{parse_instant, NodeIdentity};
    use crate::testutil::MemoryStore;

    fn scheme() -> KeyScheme {
        KeyScheme::new("b", "p", "Test")
    }

    fn identity() -> NodeIdentity {
        NodeIdentity {
            cluster_name: "Test".into(),
            token: "100".into(),
            region: "r".into(),
        }
    }

    fn sst(file_name: &str, instant: &str, size: u64) -> BackupPath {
        BackupPath::new_data(
            &scheme(),
            &identity(),
            BackupFileType::Sst,
            parse_instant(instant).unwrap(),
            "ks1",
            Some("cf1"),
            file_name,
            size,
            parse_instant(instant).unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn finalize_sorts_entries_by_remote_key() {
        let builder = ManifestBuilder::new("Test", "100", parse_instant("201806051234").unwrap(), Codec::Snappy);
        builder.add(&sst("zz-1-big-Data.db", "201806051234", 10), "h1".into());
        builder.add(&sst("aa-1-big-Data.db", "201806051234", 20), "h2".into());
        let manifest = builder.finalize();
        assert_eq!(manifest.version, 2);
        assert!(manifest.entries[0].remote_key < manifest.entries[1].remote_key);
        assert!(!manifest.schema_hash.is_empty());
    }

    #[test]
    fn identical_rounds_produce_identical_manifests() {
        let make = || {
            let builder = ManifestBuilder::new(
                "Test",
                "100",
                parse_instant("201806051234").unwrap(),
                Codec::Snappy,
            );
            builder.add(&sst("b-1-big-Data.db", "201806051234", 10), "h".into());
            builder.add(&sst("a-1-big-Data.db", "201806051234", 10), "h".into());
            serde_json::to_vec(&builder.finalize()).unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn write_then_find_roundtrips() {
        let store = MemoryStore::new();
        let instant = parse_instant("201806051234").unwrap();
        let builder = ManifestBuilder::new("Test", "100", instant, Codec::Snappy);
        builder.add(&sst("mc-1-big-Data.db", "201806051234", 1024), "abc".into());
        let manifest = builder.finalize();
        let key = write_manifest(&store, &scheme(), &manifest).unwrap();
        assert_eq!(key, "b/p/tseT/100/META/201806051234/manifest.json");

        let (reference, loaded) = find_at_or_before(
            &store,
            &scheme(),
            "100",
            "r",
            parse_instant("201806051235").unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.version, 2);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].size, 1024);
        assert_eq!(loaded.codec().unwrap(), Codec::Snappy);
    }

    #[test]
    fn selection_takes_newest_at_or_before() {
        let store = MemoryStore::new();
        for instant in ["201806051200", "201806051230", "201806051300"] {
            let builder = ManifestBuilder::new(
                "Test",
                "100",
                parse_instant(instant).unwrap(),
                Codec::Snappy,
            );
            write_manifest(&store, &scheme(), &builder.finalize()).unwrap();
        }
        let (reference, _) = find_at_or_before(
            &store,
            &scheme(),
            "100",
            "r",
            parse_instant("201806051245").unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.instant, parse_instant("201806051230").unwrap());

        // A target before the first manifest finds nothing.
        let none = find_at_or_before(
            &store,
            &scheme(),
            "100",
            "r",
            parse_instant("201806051100").unwrap(),
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn v1_manifest_is_normalized() {
        let store = MemoryStore::new();
        let keys = vec![
            "b/p/tseT/100/201806051234/ks1/cf1/SST/mc-2-big-Data.db".to_string(),
            "b/p/tseT/100/201806051234/ks1/cf1/SST/mc-1-big-Data.db".to_string(),
        ];
        let body = serde_json::to_vec(&keys).unwrap();
        let v1_key = scheme().meta_v1_key("100", parse_instant("201806051234").unwrap());
        let size = body.len() as u64;
        store.put(&v1_key, &mut Cursor::new(body), size).unwrap();

        let (reference, manifest) = find_at_or_before(
            &store,
            &scheme(),
            "100",
            "r",
            parse_instant("201806051234").unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.version, 1);
        assert_eq!(manifest.version, 1);
        assert!(!manifest.has_sizes());
        assert_eq!(manifest.codec().unwrap(), Codec::Lzf);
        assert_eq!(manifest.entries.len(), 2);
        // Normalization sorts by remote key.
        assert!(manifest.entries[0].remote_key < manifest.entries[1].remote_key);
        assert_eq!(manifest.entries[0].keyspace, "ks1");
        assert_eq!(manifest.entries[0].column_family.as_deref(), Some("cf1"));
        assert_eq!(manifest.token, "100");
    }

    #[test]
    fn garbage_manifest_is_broken_not_a_panic() {
        let store = MemoryStore::new();
        let key = scheme().meta_v2_key("100", parse_instant("201806051234").unwrap(), MANIFEST_FILE_NAME);
        store
            .put(&key, &mut Cursor::new(b"not json".to_vec()), 8)
            .unwrap();
        let err = find_at_or_before(
            &store,
            &scheme(),
            "100",
            "r",
            parse_instant("201806051234").unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, StelaError::ManifestBroken(_)));
    }

    #[test]
    fn prune_removes_only_expired_manifests() {
        let store = MemoryStore::new();
        for instant in ["201801010000", "201806050000"] {
            let builder = ManifestBuilder::new(
                "Test",
                "100",
                parse_instant(instant).unwrap(),
                Codec::Snappy,
            );
            write_manifest(&store, &scheme(), &builder.finalize()).unwrap();
        }
        let now = parse_instant("201806100000").unwrap();
        let removed = prune_expired(&store, &scheme(), "100", "r", 30, now).unwrap();
        assert_eq!(removed, 1);
        let left = list_manifests(&store, &scheme(), "100", "r").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instant, parse_instant("201806050000").unwrap());
    }
}
