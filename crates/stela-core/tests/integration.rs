//! End-to-end scenarios: full rounds against an in-memory store, restores
//! into a fresh node, failure injection, and the pipeline's rate and
//! concurrency bounds.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};

use stela_core::backup::{run_round, BackupContext, RoundKind, RoundOutcome};
use stela_core::backup_path::parse_instant;
use stela_core::clock::Clock;
use stela_core::compress::{compress_stream, Codec};
use stela_core::config::StelaConfig;
use stela_core::error::StelaError;
use stela_core::fingerprint::UploadFingerprintCache;
use stela_core::manifest::Manifest;
use stela_core::restore::{self, RestoreContext, RestoreOutcome, RestoreRequest};
use stela_core::status::StatusRegistry;
use stela_core::storage::ObjectStore;
use stela_core::testutil::{test_config, FixedClock, MemoryStore, MockDbControl};
use stela_core::throttle::Governor;

struct Node {
    _data: tempfile::TempDir,
    _commitlog: tempfile::TempDir,
    config: StelaConfig,
    store: std::sync::Arc<MemoryStore>,
    db: MockDbControl,
    clock: FixedClock,
    registry: StatusRegistry,
    cache: UploadFingerprintCache,
}

impl Node {
    fn new(store: std::sync::Arc<MemoryStore>, instant: &str) -> Self {
        let data = tempfile::tempdir().unwrap();
        let commitlog = tempfile::tempdir().unwrap();
        let config = test_config(
            "/unused",
            data.path().to_str().unwrap(),
            commitlog.path().to_str().unwrap(),
        );
        let db = MockDbControl::with_data_dir(data.path().to_path_buf());
        Self {
            config,
            store,
            db,
            clock: FixedClock::at(parse_instant(instant).unwrap()),
            registry: StatusRegistry::new(1024),
            cache: UploadFingerprintCache::new(),
            _data: data,
            _commitlog: commitlog,
        }
    }

    fn data_dir(&self) -> &Path {
        Path::new(&self.config.data_file_location)
    }

    fn write_live_sstable(&self, ks: &str, cf: &str, name: &str, bytes: &[u8]) {
        let dir = self.data_dir().join(ks).join(cf);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), bytes).unwrap();
    }

    fn write_incremental(&self, ks: &str, cf: &str, name: &str, bytes: &[u8]) {
        let dir = self.data_dir().join(ks).join(cf).join("backups");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join(name);
        fs::write(&file, bytes).unwrap();
        stela_core::testutil::set_file_mtime(&file, self.clock.now());
    }

    fn run_snapshot_round(&self) -> RoundOutcome {
        let governor = Governor::new(
            self.config.max_concurrent_files,
            self.config.upload_rate_bytes_per_sec,
        );
        let ctx = BackupContext {
            config: &self.config,
            store: &*self.store,
            db: &self.db,
            clock: &self.clock,
            governor: &governor,
            registry: &self.registry,
            cache: &self.cache,
        };
        run_round(&ctx, RoundKind::Snapshot)
    }

    fn restore_at(&self, at: DateTime<Utc>) -> RestoreOutcome {
        let request = RestoreRequest {
            token: "100".into(),
            at,
            keyspace: None,
            column_family: None,
        };
        let scheme = self.config.key_scheme();
        let plan = restore::plan(&*self.store, &scheme, "us-east-1", &request).unwrap();
        let governor = Governor::new(self.config.max_concurrent_restores, 0);
        let ctx = RestoreContext {
            config: &self.config,
            store: &*self.store,
            db: &self.db,
            clock: &self.clock,
            governor: &governor,
            registry: &self.registry,
        };
        restore::execute(&ctx, &plan)
    }
}

fn snappy_bytes(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    compress_stream(Codec::Snappy, Box::new(std::io::Cursor::new(payload.to_vec())))
        .read_to_end(&mut out)
        .unwrap();
    out
}

// S1: a round produces the canonical key and manifest, and a restore into
// a fresh node reproduces the original bytes.
#[test]
fn s1_round_trip_through_canonical_keys() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    node.write_incremental("ks1", "cf1", "mc-1-big-Data.db", &payload);

    let outcome = node.run_snapshot_round();
    let RoundOutcome::Success { manifest_key, .. } = outcome else {
        panic!("round failed: {outcome:?}");
    };
    assert_eq!(
        manifest_key.as_deref(),
        Some("b/p/tseT/100/META/201806051234/manifest.json")
    );
    assert!(store
        .exists("b/p/tseT/100/201806051234/ks1/cf1/SST/mc-1-big-Data.db")
        .unwrap());

    // Fresh node, same token: pull the data back.
    let target = Node::new(std::sync::Arc::clone(&store), "201806051235");
    let outcome = target.restore_at(parse_instant("201806051235").unwrap());
    assert!(outcome.is_success(), "restore failed: {outcome:?}");
    let restored = target.data_dir().join("ks1/cf1/mc-1-big-Data.db");
    assert_eq!(fs::read(&restored).unwrap(), payload);
    assert_eq!(
        target.db.refreshed(),
        vec![("ks1".to_string(), "cf1".to_string())]
    );
}

// S2: re-running an unchanged round uploads nothing and reproduces the
// manifest byte for byte.
#[test]
fn s2_rerun_is_deduplicated_and_idempotent() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    node.write_live_sstable("ks1", "cf1", "mc-1-big-Data.db", &[7u8; 2048]);

    assert!(node.run_snapshot_round().is_success());
    let manifest_key = "b/p/tseT/100/META/201806051234/manifest.json";
    let first = store.get_bytes(manifest_key).unwrap();
    let puts_before = store.put_count();

    let RoundOutcome::Success {
        uploaded, skipped, ..
    } = node.run_snapshot_round()
    else {
        panic!("second round failed");
    };
    assert_eq!(uploaded, 0);
    assert_eq!(skipped, 1);
    assert_eq!(store.get_bytes(manifest_key).unwrap(), first);
    // Only the manifest was re-put.
    assert_eq!(store.put_count(), puts_before + 1);
}

// S3: restore between two incrementals sees the snapshot plus only the
// first incremental.
#[test]
fn s3_point_in_time_composes_snapshot_and_incrementals() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051200");
    node.write_live_sstable("ks1", "cf1", "mc-1-big-Data.db", b"snapshot-state");
    assert!(node.run_snapshot_round().is_success());

    // Incrementals shipped by later watcher sweeps, one and two minutes on.
    store.put_bytes(
        "b/p/tseT/100/201806051201/ks1/cf1/SST/mc-2-big-Data.db",
        &snappy_bytes(b"first-incremental"),
    );
    store.put_bytes(
        "b/p/tseT/100/201806051202/ks1/cf1/SST/mc-3-big-Data.db",
        &snappy_bytes(b"second-incremental"),
    );

    let target = Node::new(std::sync::Arc::clone(&store), "201806051230");
    let at = parse_instant("201806051201").unwrap() + Duration::seconds(30);
    let outcome = target.restore_at(at);
    assert!(outcome.is_success(), "restore failed: {outcome:?}");

    let cf_dir = target.data_dir().join("ks1/cf1");
    assert_eq!(fs::read(cf_dir.join("mc-1-big-Data.db")).unwrap(), b"snapshot-state");
    assert_eq!(
        fs::read(cf_dir.join("mc-2-big-Data.db")).unwrap(),
        b"first-incremental"
    );
    assert!(!cf_dir.join("mc-3-big-Data.db").exists());
}

// S4/S5: a permanently failing key makes the round partial with no
// manifest; once the failure clears, a re-run publishes a manifest
// covering every file.
#[test]
fn s4_s5_partial_failure_then_resume() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    node.write_live_sstable("ks1", "cf1", "aa-1-big-Data.db", &[1u8; 256]);
    node.write_live_sstable("ks1", "cf1", "bb-1-big-Data.db", &[2u8; 256]);

    let poisoned = "b/p/tseT/100/201806051234/ks1/cf1/SNAP/aa-1-big-Data.db";
    store.fail_permanently(poisoned);

    let outcome = node.run_snapshot_round();
    let RoundOutcome::PartialFailure { failed, .. } = outcome else {
        panic!("expected partial failure, got {outcome:?}");
    };
    assert_eq!(failed, 1);
    let manifest_key = "b/p/tseT/100/META/201806051234/manifest.json";
    assert!(store.get_bytes(manifest_key).is_none());
    // The healthy file was not lost.
    assert!(store
        .exists("b/p/tseT/100/201806051234/ks1/cf1/SNAP/bb-1-big-Data.db")
        .unwrap());

    // S5: the failure becomes transient; the next round succeeds and the
    // manifest covers both files.
    store.clear_permanent_failures();
    store.fail_transiently(poisoned, 1);
    assert!(node.run_snapshot_round().is_success());
    let manifest: Manifest =
        serde_json::from_slice(&store.get_bytes(manifest_key).unwrap()).unwrap();
    let names: Vec<&str> = manifest
        .entries
        .iter()
        .map(|e| e.file_name.as_str())
        .collect();
    assert_eq!(names, ["aa-1-big-Data.db", "bb-1-big-Data.db"]);
    for entry in &manifest.entries {
        assert!(store.exists(&entry.remote_key).unwrap(), "{}", entry.remote_key);
    }
}

// S6 (scaled down): the byte-rate limiter stretches a round; removing the
// limit removes the stretch.
#[test]
fn s6_rate_limit_bounds_throughput() {
    let elapsed_with_rate = {
        let store = std::sync::Arc::new(MemoryStore::new());
        let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
        let mut config = node.config.clone();
        config.compression_codec = "none".into();
        config.upload_rate_bytes_per_sec = 500_000;
        let node = Node { config, ..node };
        for i in 0..4 {
            node.write_incremental("ks1", "cf1", &format!("mc-{i}-big-Data.db"), &[9u8; 250_000]);
        }
        let start = Instant::now();
        assert!(node.run_snapshot_round().is_success());
        start.elapsed()
    };
    // 1 MB total at 500 kB/s with a 500 kB burst: at least ~1 s.
    assert!(
        elapsed_with_rate >= StdDuration::from_millis(800),
        "rate limit was not applied: {elapsed_with_rate:?}"
    );

    let elapsed_unlimited = {
        let store = std::sync::Arc::new(MemoryStore::new());
        let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
        let mut config = node.config.clone();
        config.compression_codec = "none".into();
        let node = Node { config, ..node };
        for i in 0..4 {
            node.write_incremental("ks1", "cf1", &format!("mc-{i}-big-Data.db"), &[9u8; 250_000]);
        }
        let start = Instant::now();
        assert!(node.run_snapshot_round().is_success());
        start.elapsed()
    };
    assert!(
        elapsed_unlimited < StdDuration::from_millis(500),
        "unlimited round was unexpectedly slow: {elapsed_unlimited:?}"
    );
}

// S7: malformed keys decode to MalformedKey.
#[test]
fn s7_malformed_key_is_rejected() {
    let scheme = stela_core::backup_path::KeyScheme::new("b", "p", "Test");
    let err = stela_core::backup_path::BackupPath::decode(
        &scheme,
        "b/p/tseT/100/NOT_A_DATE/ks/cf/SST/x",
        "us-east-1",
    )
    .unwrap_err();
    assert!(matches!(err, StelaError::MalformedKey(_)));
}

// Law 8: concurrent transfers never exceed max_concurrent_files.
#[test]
fn concurrency_never_exceeds_the_slot_count() {
    let store = std::sync::Arc::new(MemoryStore::new());
    store.set_put_delay(StdDuration::from_millis(15));
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    let mut config = node.config.clone();
    config.max_concurrent_files = 2;
    let node = Node { config, ..node };
    for i in 0..8 {
        node.write_incremental("ks1", "cf1", &format!("mc-{i}-big-Data.db"), &[3u8; 512]);
    }
    assert!(node.run_snapshot_round().is_success());
    assert!(
        store.peak_concurrent_puts() <= 2,
        "peak {} exceeded the slot count",
        store.peak_concurrent_puts()
    );
}

// Law 3 and law 6 together: a published manifest only ever references
// keys that exist.
#[test]
fn manifests_only_reference_existing_objects() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    node.write_live_sstable("ks1", "cf1", "mc-1-big-Data.db", &[1u8; 128]);
    node.write_live_sstable("ks2", "cf2", "mc-2-big-Data.db", &[2u8; 128]);
    node.write_incremental("ks1", "cf1", "mc-3-big-Data.db", &[3u8; 128]);
    assert!(node.run_snapshot_round().is_success());

    let manifest: Manifest = serde_json::from_slice(
        &store
            .get_bytes("b/p/tseT/100/META/201806051234/manifest.json")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(manifest.entries.len(), 3);
    for entry in &manifest.entries {
        assert!(store.exists(&entry.remote_key).unwrap(), "{}", entry.remote_key);
    }
    // Ordering within the manifest is by remote key.
    assert!(manifest
        .entries
        .windows(2)
        .all(|w| w[0].remote_key < w[1].remote_key));
}

// Commit logs ship and restore into the commit-log directory.
#[test]
fn commit_logs_restore_to_their_own_directory() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let node = Node::new(std::sync::Arc::clone(&store), "201806051234");
    let segment = Path::new(&node.config.commit_log_location).join("CommitLog-7-1.log");
    fs::write(&segment, b"mutations").unwrap();
    stela_core::testutil::set_file_mtime(&segment, node.clock.now());
    assert!(node.run_snapshot_round().is_success());

    let target = Node::new(std::sync::Arc::clone(&store), "201806051240");
    let outcome = target.restore_at(parse_instant("201806051240").unwrap());
    assert!(outcome.is_success(), "restore failed: {outcome:?}");
    let restored = Path::new(&target.config.commit_log_location).join("CommitLog-7-1.log");
    assert_eq!(fs::read(&restored).unwrap(), b"mutations");
}
