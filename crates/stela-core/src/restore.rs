//! Restore: resolve a point-in-time view of one node's data, fetch it,
//! and hand the files to the database.
//!
//! The plan starts from the newest manifest at or before the target time.
//! When that manifest carries snapshot files, any incremental SSTables
//! shipped after the snapshot and at or before the target are folded in
//! by a time-scoped key listing, composing snapshot + incrementals into
//! the requested instant.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::backup_path::{BackupFileType, BackupPath, KeyScheme};
use crate::clock::Clock;
use crate::compress::{classify_stream_error, decompress_stream, Codec};
use crate::config::StelaConfig;
use crate::dbcontrol::DbControl;
use crate::error::{Result, StelaError};
use crate::manifest;
use crate::status::{StatusRegistry, TransferState};
use crate::storage::{scan_prefix, ObjectStore, RestartingReader, StoreError};
use crate::throttle::{CancelToken, Governor};

pub struct RestoreContext<'a> {
    pub config: &'a StelaConfig,
    pub store: &'a dyn ObjectStore,
    pub db: &'a dyn DbControl,
    pub clock: &'a dyn Clock,
    pub governor: &'a Governor,
    pub registry: &'a StatusRegistry,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub token: String,
    pub at: DateTime<Utc>,
    pub keyspace: Option<String>,
    pub column_family: Option<String>,
}

impl RestoreRequest {
    fn admits(&self, path: &BackupPath) -> bool {
        if let Some(ks) = &self.keyspace {
            if path.keyspace.as_deref() != Some(ks.as_str()) {
                return false;
            }
        }
        if let Some(cf) = &self.column_family {
            if path.column_family.as_deref() != Some(cf.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One file to place.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub path: BackupPath,
    /// Source size when the manifest knew it; `None` disables the
    /// same-size skip and the file is always overwritten.
    pub size: Option<u64>,
}

#[derive(Debug)]
pub struct RestorePlan {
    pub manifest_instant: DateTime<Utc>,
    pub manifest_version: u32,
    pub codec: Codec,
    pub entries: Vec<PlanEntry>,
}

/// Resolve the object set for `{token, at}`, honoring the caller's filter.
pub fn plan(
    store: &dyn ObjectStore,
    scheme: &KeyScheme,
    region: &str,
    request: &RestoreRequest,
) -> Result<RestorePlan> {
    let Some((reference, manifest)) =
        manifest::find_at_or_before(store, scheme, &request.token, region, request.at)?
    else {
        return Err(StelaError::ManifestNotFound {
            token: request.token.clone(),
            at: request.at.to_rfc3339(),
        });
    };
    let codec = manifest.codec()?;
    let has_sizes = manifest.has_sizes();

    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    let mut has_snapshot_entries = false;
    for entry in &manifest.entries {
        let path = BackupPath::decode(scheme, &entry.remote_key, region).map_err(|e| {
            StelaError::ManifestBroken(format!(
                "manifest {} references malformed key: {e}",
                reference.key
            ))
        })?;
        has_snapshot_entries |= path.file_type == BackupFileType::Snap;
        if !request.admits(&path) {
            continue;
        }
        seen.insert(entry.remote_key.clone());
        entries.push(PlanEntry {
            path: path.with_size(entry.size),
            size: has_sizes.then_some(entry.size),
        });
    }

    // Point-in-time composition: snapshot plus the incrementals shipped
    // in (snapshot instant, target].
    if has_snapshot_entries && request.at > reference.instant {
        let prefix = scheme.partial_prefix(&request.token, reference.instant, request.at);
        for object in scan_prefix(store, &prefix) {
            let object = object?;
            if seen.contains(&object.key) {
                continue;
            }
            let Ok(path) = BackupPath::decode(scheme, &object.key, region) else {
                continue;
            };
            if path.file_type != BackupFileType::Sst {
                continue;
            }
            if path.time <= reference.instant || path.time > request.at {
                continue;
            }
            if !request.admits(&path) {
                continue;
            }
            seen.insert(object.key);
            entries.push(PlanEntry {
                path,
                size: None,
            });
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(RestorePlan {
        manifest_instant: reference.instant,
        manifest_version: reference.version,
        codec,
        entries,
    })
}

#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub refreshed_tables: usize,
    pub records: Vec<String>,
}

#[derive(Debug)]
pub enum RestoreOutcome {
    Success(RestoreStats),
    Failed {
        cause: StelaError,
        stats: RestoreStats,
    },
}

impl RestoreOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RestoreOutcome::Success(_))
    }
}

#[derive(Default)]
struct FetchTally {
    fetched: usize,
    skipped: usize,
    failed: usize,
    records: Vec<String>,
    first_error: Option<StelaError>,
}

/// Fetch and place every plan entry, then ask the database to open the
/// new files. Placed files survive a failed run; re-running resumes.
pub fn execute(ctx: &RestoreContext<'_>, plan: &RestorePlan) -> RestoreOutcome {
    let data_dir = Path::new(&ctx.config.data_file_location);
    let commit_log_dir = Path::new(&ctx.config.commit_log_location);

    let cancel = CancelToken::new();
    let deadline = Instant::now() + ctx.config.round_timeout_duration();
    let tally = Mutex::new(FetchTally::default());

    let workers = ctx.config.max_concurrent_restores.min(plan.entries.len().max(1));
    let (tx, rx) = crossbeam_channel::bounded::<PlanEntry>(workers * 2);
    std::thread::scope(|s| {
        for _ in 0..workers {
            let rx = rx.clone();
            let cancel = &cancel;
            let tally = &tally;
            s.spawn(move || {
                while let Ok(entry) = rx.recv() {
                    if Instant::now() > deadline {
                        cancel.cancel();
                    }
                    let key = entry.path.remote_key().to_string();
                    match fetch_one(ctx, &entry, plan.codec, cancel, data_dir, commit_log_dir) {
                        Ok(Placement::Placed) => {
                            let mut t = tally.lock().unwrap();
                            t.fetched += 1;
                            t.records.push(key);
                        }
                        Ok(Placement::SkippedSameSize) => {
                            tally.lock().unwrap().skipped += 1;
                        }
                        Ok(Placement::NotLocal) => {}
                        Err(e) => {
                            let mut t = tally.lock().unwrap();
                            t.failed += 1;
                            t.records.push(key);
                            if t.first_error.is_none() {
                                t.first_error = Some(e);
                            }
                            // A terminal fetch failure aborts the restore.
                            cancel.cancel();
                        }
                    }
                }
            });
        }
        drop(rx);
        for entry in plan.entries.iter().cloned() {
            if tx.send(entry).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let FetchTally {
        fetched,
        skipped,
        failed,
        records,
        first_error,
    } = tally.into_inner().unwrap();
    let mut stats = RestoreStats {
        fetched,
        skipped,
        failed,
        refreshed_tables: 0,
        records,
    };

    if let Some(cause) = first_error {
        tracing::error!(fetched, failed, "restore aborted: {cause}");
        return RestoreOutcome::Failed { cause, stats };
    }
    if cancel.is_cancelled() {
        return RestoreOutcome::Failed {
            cause: StelaError::Timeout("restore exceeded its deadline".into()),
            stats,
        };
    }

    // Commit: the database opens the files we placed. Refresh failures are
    // logged, not fatal; the files are already on disk.
    let mut tables = BTreeSet::new();
    for entry in &plan.entries {
        if let (Some(ks), Some(cf)) = (
            entry.path.keyspace.as_deref(),
            entry.path.column_family.as_deref(),
        ) {
            tables.insert((ks.to_string(), cf.to_string()));
        }
    }
    for (ks, cf) in tables {
        match ctx.db.refresh(&ks, &cf) {
            Ok(()) => stats.refreshed_tables += 1,
            Err(e) => tracing::warn!(keyspace = %ks, column_family = %cf, "refresh failed: {e}"),
        }
    }

    tracing::info!(
        fetched = stats.fetched,
        skipped = stats.skipped,
        refreshed = stats.refreshed_tables,
        "restore complete"
    );
    RestoreOutcome::Success(stats)
}

enum Placement {
    Placed,
    SkippedSameSize,
    /// Manifest entries without a local destination (meta records).
    NotLocal,
}

fn fetch_one(
    ctx: &RestoreContext<'_>,
    entry: &PlanEntry,
    codec: Codec,
    cancel: &CancelToken,
    data_dir: &Path,
    commit_log_dir: &Path,
) -> Result<Placement> {
    let Some(target) = entry.path.restore_target(data_dir, commit_log_dir) else {
        return Ok(Placement::NotLocal);
    };
    if let (Some(expected), Ok(meta)) = (entry.size, std::fs::metadata(&target)) {
        if meta.is_file() && meta.len() == expected {
            tracing::debug!(target = %target.display(), "destination already has same size, skipping");
            return Ok(Placement::SkippedSameSize);
        }
    }

    let key = entry.path.remote_key().to_string();
    let handle = ctx.registry.enqueue(&key, ctx.clock.now());
    let retry = ctx.config.retry_policy();
    let file_deadline = Instant::now() + ctx.config.file_timeout_duration();

    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            ctx.registry
                .record_failure(&handle, "cancelled", ctx.clock.now());
            return Err(StelaError::Cancelled);
        }
        if Instant::now() > file_deadline {
            let e = StelaError::Timeout(format!("fetch of {key} hit its deadline"));
            ctx.registry
                .record_failure(&handle, &e.to_string(), ctx.clock.now());
            return Err(e);
        }

        ctx.registry
            .transition(&handle, TransferState::Running, ctx.clock.now());
        match attempt_fetch(ctx, &key, codec, cancel, &target) {
            Ok(bytes) => {
                ctx.registry.add_bytes(&handle, bytes);
                ctx.registry
                    .transition(&handle, TransferState::Done, ctx.clock.now());
                return Ok(Placement::Placed);
            }
            Err(e) if e.is_retryable() && attempt < retry.attempts.max(1) => {
                let delay = retry.backoff(attempt);
                tracing::warn!(%key, attempt, "fetch attempt failed, retrying: {e}");
                std::thread::sleep(delay);
            }
            Err(e) => {
                ctx.registry
                    .record_failure(&handle, &e.to_string(), ctx.clock.now());
                return Err(e);
            }
        }
    }
}

/// One attempt: open the remote stream, decompress through the governor,
/// write a sibling temp file, rename into place.
fn attempt_fetch(
    ctx: &RestoreContext<'_>,
    key: &str,
    codec: Codec,
    cancel: &CancelToken,
    target: &Path,
) -> Result<u64> {
    let reader = match RestartingReader::open(ctx.store, key, ctx.config.retry_attempts) {
        Ok(r) => r,
        // A manifest key that is gone means the backup set is broken, not
        // that this transfer should be retried.
        Err(StoreError::NotFound(k)) => {
            return Err(StelaError::ManifestBroken(format!(
                "referenced object missing from store: {k}"
            )))
        }
        Err(e) => return Err(e.into()),
    };
    let decompressed = decompress_stream(codec, Box::new(reader));

    let ticket = ctx.governor.admit(cancel)?;
    let mut throttled = ticket.wrap_reader(decompressed);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restore".to_string());
    let tmp = target.with_file_name(format!(".{file_name}.stela-tmp"));

    let copy_result: std::result::Result<u64, io::Error> = (|| {
        let mut out = std::fs::File::create(&tmp)?;
        let n = io::copy(&mut throttled, &mut out)?;
        out.sync_all()?;
        Ok(n)
    })();

    match copy_result {
        Ok(bytes) => {
            std::fs::rename(&tmp, target)?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            if cancel.is_cancelled() {
                return Err(StelaError::Cancelled);
            }
            Err(classify_stream_error(e))
        }
    }
}
