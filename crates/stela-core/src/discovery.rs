//! Walks the database data directory and turns files into [`BackupPath`]
//! records. The layout is fixed by the database: snapshots are hardlink
//! sets under `<dataDir>/<ks>/<cf>/snapshots/<tag>/`, incrementals appear
//! under `<dataDir>/<ks>/<cf>/backups/`, commit logs live in their own
//! directory.

use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::backup_path::{BackupFileType, BackupPath, KeyScheme, NodeIdentity, COMMITLOG_KEYSPACE};
use crate::clock::truncate_to_minute;
use crate::error::Result;

fn file_mtime(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Per-keyspace, per-column-family subdirectories of the data directory.
fn keyspace_tables(data_dir: &Path) -> Result<Vec<(String, String, std::path::PathBuf)>> {
    let mut out = Vec::new();
    if !data_dir.exists() {
        return Ok(out);
    }
    for ks_entry in std::fs::read_dir(data_dir)? {
        let ks_entry = ks_entry?;
        if !ks_entry.file_type()?.is_dir() {
            continue;
        }
        let keyspace = ks_entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&keyspace) {
            continue;
        }
        for cf_entry in std::fs::read_dir(ks_entry.path())? {
            let cf_entry = cf_entry?;
            if !cf_entry.file_type()?.is_dir() {
                continue;
            }
            let column_family = cf_entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&column_family) {
                continue;
            }
            out.push((keyspace.clone(), column_family, cf_entry.path()));
        }
    }
    Ok(out)
}

/// Collect the regular files directly under `dir` as records of `file_type`.
fn collect_files(
    scheme: &KeyScheme,
    identity: &NodeIdentity,
    dir: &Path,
    keyspace: &str,
    column_family: Option<&str>,
    file_type: BackupFileType,
    fixed_time: Option<DateTime<Utc>>,
    out: &mut Vec<BackupPath>,
) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            std::io::Error::other(format!("walk {}: {e}", dir.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&file_name) {
            continue;
        }
        let meta = entry.metadata().map_err(|e| {
            std::io::Error::other(format!("stat {}: {e}", entry.path().display()))
        })?;
        let mtime = file_mtime(&meta);
        // SNAP records carry the snapshot tag's instant; SST/CL carry the
        // file's own modification instant.
        let time = fixed_time.unwrap_or_else(|| truncate_to_minute(mtime));
        out.push(BackupPath::new_data(
            scheme,
            identity,
            file_type,
            time,
            keyspace,
            column_family,
            &file_name,
            meta.len(),
            mtime,
            Some(entry.path().to_path_buf()),
        )?);
    }
    Ok(())
}

/// Files in every `<ks>/<cf>/snapshots/<tag>/` directory.
pub fn snapshot_files(
    scheme: &KeyScheme,
    identity: &NodeIdentity,
    data_dir: &Path,
    tag: &str,
    tag_time: DateTime<Utc>,
) -> Result<Vec<BackupPath>> {
    let mut out = Vec::new();
    for (keyspace, column_family, cf_dir) in keyspace_tables(data_dir)? {
        let snap_dir = cf_dir.join("snapshots").join(tag);
        collect_files(
            scheme,
            identity,
            &snap_dir,
            &keyspace,
            Some(&column_family),
            BackupFileType::Snap,
            Some(tag_time),
            &mut out,
        )?;
    }
    out.sort();
    Ok(out)
}

/// New SSTables in every `<ks>/<cf>/backups/` directory.
pub fn incremental_files(
    scheme: &KeyScheme,
    identity: &NodeIdentity,
    data_dir: &Path,
) -> Result<Vec<BackupPath>> {
    let mut out = Vec::new();
    for (keyspace, column_family, cf_dir) in keyspace_tables(data_dir)? {
        collect_files(
            scheme,
            identity,
            &cf_dir.join("backups"),
            &keyspace,
            Some(&column_family),
            BackupFileType::Sst,
            None,
            &mut out,
        )?;
    }
    out.sort();
    Ok(out)
}

/// Commit-log segments in the commit-log directory.
pub fn commit_log_files(
    scheme: &KeyScheme,
    identity: &NodeIdentity,
    commit_log_dir: &Path,
) -> Result<Vec<BackupPath>> {
    let mut out = Vec::new();
    collect_files(
        scheme,
        identity,
        commit_log_dir,
        COMMITLOG_KEYSPACE,
        None,
        BackupFileType::Cl,
        None,
        &mut out,
    )?;
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_path::parse_instant;
    use std::fs;
    use tempfile::tempdir;

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

    #[test]
    fn snapshot_walk_finds_tagged_files_only() {
        let dir = tempdir().unwrap();
        let tagged = dir.path().join("ks1/cf1/snapshots/201806051234");
        fs::create_dir_all(&tagged).unwrap();
        fs::write(tagged.join("mc-1-big-Data.db"), vec![0u8; 64]).unwrap();
        let other = dir.path().join("ks1/cf1/snapshots/201806050000");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("old-1-big-Data.db"), b"x").unwrap();

        let tag_time = parse_instant("201806051234").unwrap();
        let found =
            snapshot_files(&scheme(), &identity(), dir.path(), "201806051234", tag_time).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_type, BackupFileType::Snap);
        assert_eq!(found[0].time, tag_time);
        assert_eq!(found[0].size, 64);
        assert_eq!(
            found[0].remote_key(),
            "b/p/tseT/100/201806051234/ks1/cf1/SNAP/mc-1-big-Data.db"
        );
    }

    #[test]
    fn incremental_walk_reads_backups_dirs() {
        let dir = tempdir().unwrap();
        let backups = dir.path().join("ks1/cf1/backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("mc-7-big-Data.db"), vec![1u8; 32]).unwrap();
        // Live sstables outside backups/ are not incremental candidates.
        fs::write(dir.path().join("ks1/cf1/mc-7-big-Data.db"), b"live").unwrap();

        let found = incremental_files(&scheme(), &identity(), dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_type, BackupFileType::Sst);
        assert_eq!(found[0].size, 32);
        assert!(found[0].local_file.as_ref().unwrap().ends_with("backups/mc-7-big-Data.db"));
    }

    #[test]
    fn missing_directories_yield_empty_sets() {
        let dir = tempdir().unwrap();
        assert!(incremental_files(&scheme(), &identity(), dir.path())
            .unwrap()
            .is_empty());
        assert!(commit_log_files(
            &scheme(),
            &identity(),
            &dir.path().join("absent")
        )
        .unwrap()
        .is_empty());
    }

    #[test]
    fn commit_logs_use_the_fixed_keyspace() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("CommitLog-7-1.log"), vec![0u8; 16]).unwrap();
        let found = commit_log_files(&scheme(), &identity(), dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_type, BackupFileType::Cl);
        assert_eq!(found[0].keyspace.as_deref(), Some(COMMITLOG_KEYSPACE));
        assert_eq!(found[0].column_family, None);
    }

    #[test]
    fn hidden_files_and_dirs_are_skipped() {
        let dir = tempdir().unwrap();
        let backups = dir.path().join("ks1/cf1/backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join(".hidden"), b"x").unwrap();
        let hidden_ks = dir.path().join(".snapshot-scratch/cf1/backups");
        fs::create_dir_all(&hidden_ks).unwrap();
        fs::write(hidden_ks.join("f-1"), b"x").unwrap();

        assert!(incremental_files(&scheme(), &identity(), dir.path())
            .unwrap()
            .is_empty());
    }
}
