//! Test support: an in-memory object store with failure injection and a
//! mock database control channel. Public so integration tests can drive
//! the pipeline against deterministic backends.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::clock::Clock;
use crate::config::{StelaConfig, StoreConfig};
use crate::dbcontrol::DbControl;
use crate::error::{Result, StelaError};
use crate::storage::{ListPage, ObjectMeta, ObjectStore, StoreError, StoreResult};

/// Configuration fixture matching the canonical test identity
/// (`app_name=Test`, `token=100`, base `b`, prefix `p`).
pub fn test_config(store_url: &str, data_dir: &str, commitlog_dir: &str) -> StelaConfig {
    StelaConfig {
        store: StoreConfig {
            url: store_url.to_string(),
            region: None,
            access_key_id: None,
            secret_access_key: None,
        },
        app_name: "Test".into(),
        token: "100".into(),
        instance_region: "us-east-1".into(),
        backup_location: "b".into(),
        backup_prefix: "p".into(),
        data_file_location: data_dir.to_string(),
        commit_log_location: commitlog_dir.to_string(),
        snapshot_schedule: None,
        incremental_enabled: true,
        max_concurrent_files: 4,
        max_concurrent_restores: 4,
        upload_rate_bytes_per_sec: 0,
        compression_codec: "snappy".into(),
        multipart_threshold: 64 * 1024 * 1024,
        multipart_part_size: 8 * 1024 * 1024,
        retry_attempts: 4,
        retry_base_delay: "1ms".into(),
        file_timeout: "30m".into(),
        round_timeout: "6h".into(),
        retention_days: 0,
    }
}

/// Small page size so every listing test exercises pagination.
const PAGE_SIZE: usize = 5;

/// Pin a file's modification time so keys derived from mtimes are
/// deterministic.
pub fn set_file_mtime(path: &std::path::Path, t: chrono::DateTime<Utc>) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open for mtime update");
    file.set_modified(std::time::SystemTime::from(t))
        .expect("set mtime");
}

/// Settable clock for deterministic rounds.
pub struct FixedClock(Mutex<chrono::DateTime<Utc>>);

impl FixedClock {
    pub fn at(t: chrono::DateTime<Utc>) -> Self {
        Self(Mutex::new(t))
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += d;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> chrono::DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    mod_time: chrono::DateTime<Utc>,
}

/// Thread-safe in-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, StoredObject>>,
    puts: AtomicUsize,
    concurrent_puts: AtomicUsize,
    peak_concurrent_puts: AtomicUsize,
    fail_permanent: Mutex<HashSet<String>>,
    fail_transient: Mutex<HashMap<String, u32>>,
    put_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&self, key: &str, bytes: &[u8]) {
        self.data.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                mod_time: Utc::now(),
            },
        );
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(key).map(|o| o.bytes.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn remove(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    /// Every put of `key` fails with a permanent error.
    pub fn fail_permanently(&self, key: &str) {
        self.fail_permanent.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_permanent_failures(&self) {
        self.fail_permanent.lock().unwrap().clear();
    }

    /// The next `times` puts of `key` fail with a transient error.
    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.fail_transient
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
    }

    /// Total successful and failed put attempts.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Highest number of puts observed in flight at once.
    pub fn peak_concurrent_puts(&self) -> usize {
        self.peak_concurrent_puts.load(Ordering::SeqCst)
    }

    /// Make every put linger, widening the window concurrency tests watch.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = Some(delay);
    }

    fn check_injected_failure(&self, key: &str) -> StoreResult<()> {
        if self.fail_permanent.lock().unwrap().contains(key) {
            return Err(StoreError::Permanent(format!("injected failure: {key}")));
        }
        let mut transient = self.fail_transient.lock().unwrap();
        if let Some(left) = transient.get_mut(key) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Transient(format!("injected blip: {key}")));
            }
            transient.remove(key);
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, reader: &mut dyn Read, _size_hint: u64) -> StoreResult<String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent_puts.fetch_max(now, Ordering::SeqCst);

        let result = (|| {
            self.check_injected_failure(key)?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(|e| StoreError::Permanent(format!("read for put {key}: {e}")))?;
            if let Some(delay) = *self.put_delay.lock().unwrap() {
                std::thread::sleep(delay);
            }
            let len = bytes.len();
            self.data.lock().unwrap().insert(
                key.to_string(),
                StoredObject {
                    bytes,
                    mod_time: Utc::now(),
                },
            );
            Ok(format!("mem-{len}"))
        })();

        self.concurrent_puts.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn get_from(&self, key: &str, offset: u64) -> StoreResult<Box<dyn Read + Send>> {
        let data = self.data.lock().unwrap();
        let object = data
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let bytes = object
            .bytes
            .get(offset.min(object.bytes.len() as u64) as usize..)
            .unwrap_or_default()
            .to_vec();
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> StoreResult<ListPage> {
        let data = self.data.lock().unwrap();
        let mut keys: Vec<&String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start_after.is_none_or(|after| k.as_str() > after))
            .collect();
        keys.sort();
        let truncated = keys.len() > PAGE_SIZE;
        keys.truncate(PAGE_SIZE);
        let objects = keys
            .into_iter()
            .map(|k| {
                let object = &data[k];
                ObjectMeta {
                    key: k.clone(),
                    size: object.bytes.len() as u64,
                    mod_time: Some(object.mod_time),
                }
            })
            .collect();
        Ok(ListPage { objects, truncated })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }
}

/// Mock control channel. With a data directory attached, `snapshot`
/// emulates the database's hardlink behavior by copying live SSTables
/// into `snapshots/<tag>/`.
#[derive(Default)]
pub struct MockDbControl {
    data_dir: Option<PathBuf>,
    snapshots: Mutex<Vec<String>>,
    cleared: Mutex<Vec<String>>,
    refreshes: Mutex<Vec<(String, String)>>,
    fail_snapshot: Mutex<bool>,
    fail_refresh: Mutex<bool>,
}

impl MockDbControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir: Some(data_dir),
            ..Self::default()
        }
    }

    pub fn fail_snapshot(&self) {
        *self.fail_snapshot.lock().unwrap() = true;
    }

    pub fn fail_refresh(&self) {
        *self.fail_refresh.lock().unwrap() = true;
    }

    pub fn snapshots_taken(&self) -> Vec<String> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn snapshots_cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn refreshed(&self) -> Vec<(String, String)> {
        self.refreshes.lock().unwrap().clone()
    }

    fn materialize_snapshot(&self, tag: &str) -> std::io::Result<()> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(());
        };
        for ks_entry in std::fs::read_dir(data_dir)? {
            let ks_entry = ks_entry?;
            if !ks_entry.file_type()?.is_dir() {
                continue;
            }
            for cf_entry in std::fs::read_dir(ks_entry.path())? {
                let cf_entry = cf_entry?;
                if !cf_entry.file_type()?.is_dir() {
                    continue;
                }
                let snap_dir = cf_entry.path().join("snapshots").join(tag);
                for file_entry in std::fs::read_dir(cf_entry.path())? {
                    let file_entry = file_entry?;
                    if !file_entry.file_type()?.is_file() {
                        continue;
                    }
                    std::fs::create_dir_all(&snap_dir)?;
                    std::fs::copy(
                        file_entry.path(),
                        snap_dir.join(file_entry.file_name()),
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl DbControl for MockDbControl {
    fn snapshot(&self, tag: &str) -> Result<()> {
        if *self.fail_snapshot.lock().unwrap() {
            return Err(StelaError::DbControl("injected snapshot failure".into()));
        }
        self.materialize_snapshot(tag)
            .map_err(|e| StelaError::DbControl(format!("snapshot {tag}: {e}")))?;
        self.snapshots.lock().unwrap().push(tag.to_string());
        Ok(())
    }

    fn refresh(&self, keyspace: &str, column_family: &str) -> Result<()> {
        if *self.fail_refresh.lock().unwrap() {
            return Err(StelaError::DbControl("injected refresh failure".into()));
        }
        self.refreshes
            .lock()
            .unwrap()
            .push((keyspace.to_string(), column_family.to_string()));
        Ok(())
    }

    fn clear_snapshot(&self, tag: &str) -> Result<()> {
        if let Some(data_dir) = &self.data_dir {
            for (_, _, cf_dir) in walk_tables(data_dir) {
                let snap_dir = cf_dir.join("snapshots").join(tag);
                if snap_dir.exists() {
                    let _ = std::fs::remove_dir_all(&snap_dir);
                }
            }
        }
        self.cleared.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}

fn walk_tables(data_dir: &std::path::Path) -> Vec<(String, String, PathBuf)> {
    let mut out = Vec::new();
    let Ok(keyspaces) = std::fs::read_dir(data_dir) else {
        return out;
    };
    for ks_entry in keyspaces.flatten() {
        if !ks_entry.path().is_dir() {
            continue;
        }
        let Ok(tables) = std::fs::read_dir(ks_entry.path()) else {
            continue;
        };
        for cf_entry in tables.flatten() {
            if cf_entry.path().is_dir() {
                out.push((
                    ks_entry.file_name().to_string_lossy().into_owned(),
                    cf_entry.file_name().to_string_lossy().into_owned(),
                    cf_entry.path(),
                ));
            }
        }
    }
    out
}
