//! Mapping between local database files and remote object keys.
//!
//! The object store has no directory semantics, so the key layout *is* the
//! index. Data files live under
//! `<base>/<prefix>/<reverse(app)>/<token>/<yyyyMMddHHmm>/<ks>/<cf>/<TYPE>/<file>`,
//! commit logs drop the column-family segment, and manifests live under a
//! `META/` subtree. The application name is reversed so keys spread across
//! the store's hash partitions, and the date format sorts lexicographically
//! so prefix scans double as time scans.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Result, StelaError};

/// Minute-resolution instant format embedded in every key.
pub const DATE_FMT: &str = "%Y%m%d%H%M";

/// Keyspace assigned to commit-log records, which have no keyspace of
/// their own on disk.
pub const COMMITLOG_KEYSPACE: &str = "commitlog";

pub fn format_instant(t: DateTime<Utc>) -> String {
    t.format(DATE_FMT).to_string()
}

pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, DATE_FMT)
        .map_err(|_| StelaError::MalformedKey(format!("not a {DATE_FMT} instant: '{s}'")))?;
    Ok(naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupFileType {
    Snap,
    Sst,
    Cl,
    Meta,
    MetaV2,
}

impl BackupFileType {
    pub fn tag(self) -> &'static str {
        match self {
            BackupFileType::Snap => "SNAP",
            BackupFileType::Sst => "SST",
            BackupFileType::Cl => "CL",
            BackupFileType::Meta => "META",
            BackupFileType::MetaV2 => "META_V2",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "SNAP" => Some(BackupFileType::Snap),
            "SST" => Some(BackupFileType::Sst),
            "CL" => Some(BackupFileType::Cl),
            "META" => Some(BackupFileType::Meta),
            "META_V2" => Some(BackupFileType::MetaV2),
            _ => None,
        }
    }

    /// SNAP/SST/CL carry database file contents; META/META_V2 are manifests.
    pub fn is_data_file(self) -> bool {
        matches!(
            self,
            BackupFileType::Snap | BackupFileType::Sst | BackupFileType::Cl
        )
    }
}

/// The node this sidecar speaks for: cluster name, ring token, region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub cluster_name: String,
    pub token: String,
    pub region: String,
}

/// Remote-key dialect: the fixed leading segments every key shares.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    base: String,
    prefix: String,
    app_reversed: String,
    app_name: String,
}

impl KeyScheme {
    pub fn new(base: &str, prefix: &str, app_name: &str) -> Self {
        Self {
            base: base.trim_matches('/').to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            app_reversed: app_name.chars().rev().collect(),
            app_name: app_name.to_string(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// `<base>/<prefix>/<reverse(app)>/<token>` — every key for a node
    /// starts here.
    pub fn token_prefix(&self, token: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base, self.prefix, self.app_reversed, token
        )
    }

    /// Prefix under which all of a node's manifests live.
    pub fn meta_prefix(&self, token: &str) -> String {
        format!("{}/META", self.token_prefix(token))
    }

    /// Longest common prefix covering every data key in `[start, end]`.
    ///
    /// Both endpoints are formatted as instants and share some leading
    /// digits; scoping a listing to that shared prefix bounds the scan.
    pub fn partial_prefix(&self, token: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let s = format_instant(start);
        let e = format_instant(end);
        let shared = common_prefix(&s, &e);
        format!("{}/{}", self.token_prefix(token), shared)
    }

    /// Remote key for a v2 manifest written at `instant`.
    pub fn meta_v2_key(&self, token: &str, instant: DateTime<Utc>, meta_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.meta_prefix(token),
            format_instant(instant),
            meta_name
        )
    }

    /// Remote key for a legacy flat v1 manifest.
    pub fn meta_v1_key(&self, token: &str, instant: DateTime<Utc>) -> String {
        format!("{}/{}-meta.json", self.meta_prefix(token), format_instant(instant))
    }

    fn strip_token_segments<'a>(&self, key: &'a str) -> Result<(&'a str, &'a str)> {
        let malformed = || StelaError::MalformedKey(format!("key outside scheme: '{key}'"));
        let lead = format!("{}/{}/{}/", self.base, self.prefix, self.app_reversed);
        let rest = key.strip_prefix(&lead).ok_or_else(malformed)?;
        let (token, rest) = rest.split_once('/').ok_or_else(malformed)?;
        if token.is_empty() {
            return Err(malformed());
        }
        Ok((token, rest))
    }
}

/// Longest shared leading substring of two strings.
fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    &a[..end]
}

/// An immutable record tying one local file to one remote object.
///
/// Two values are equal iff their remote keys are equal; ordering is
/// lexicographic over the remote key.
#[derive(Debug, Clone)]
pub struct BackupPath {
    pub file_type: BackupFileType,
    pub cluster_name: String,
    pub keyspace: Option<String>,
    pub column_family: Option<String>,
    pub token: String,
    pub region: String,
    pub time: DateTime<Utc>,
    pub file_name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size; zero until measured by the upload pipeline.
    pub compressed_size: u64,
    pub last_modified: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Local file backing this record, when it originates from discovery.
    pub local_file: Option<PathBuf>,
    remote_key: String,
}

impl BackupPath {
    /// Build a data-file record (SNAP/SST/CL) and derive its remote key.
    #[allow(clippy::too_many_arguments)]
    pub fn new_data(
        scheme: &KeyScheme,
        identity: &NodeIdentity,
        file_type: BackupFileType,
        time: DateTime<Utc>,
        keyspace: &str,
        column_family: Option<&str>,
        file_name: &str,
        size: u64,
        last_modified: DateTime<Utc>,
        local_file: Option<PathBuf>,
    ) -> Result<Self> {
        if !file_type.is_data_file() {
            return Err(StelaError::MalformedKey(format!(
                "{} is not a data file type",
                file_type.tag()
            )));
        }
        if keyspace.is_empty() || file_name.is_empty() {
            return Err(StelaError::MalformedKey(
                "data files require a keyspace and a file name".into(),
            ));
        }
        for segment in [Some(keyspace), column_family, Some(file_name)].into_iter().flatten() {
            if segment.contains('/') {
                return Err(StelaError::MalformedKey(format!(
                    "key segment contains '/': '{segment}'"
                )));
            }
        }
        let time = crate::clock::truncate_to_minute(time);
        let remote_key = match (file_type, column_family) {
            (BackupFileType::Cl, None) => format!(
                "{}/{}/{}/CL/{}",
                scheme.token_prefix(&identity.token),
                format_instant(time),
                keyspace,
                file_name
            ),
            (BackupFileType::Cl, Some(_)) => {
                return Err(StelaError::MalformedKey(
                    "commit logs carry no column family".into(),
                ))
            }
            (_, Some(cf)) if !cf.is_empty() => format!(
                "{}/{}/{}/{}/{}/{}",
                scheme.token_prefix(&identity.token),
                format_instant(time),
                keyspace,
                cf,
                file_type.tag(),
                file_name
            ),
            _ => {
                return Err(StelaError::MalformedKey(format!(
                    "{} files require a column family",
                    file_type.tag()
                )))
            }
        };
        Ok(Self {
            file_type,
            cluster_name: identity.cluster_name.clone(),
            keyspace: Some(keyspace.to_string()),
            column_family: column_family.map(str::to_string),
            token: identity.token.clone(),
            region: identity.region.clone(),
            time,
            file_name: file_name.to_string(),
            size,
            compressed_size: 0,
            last_modified,
            uploaded_at: None,
            local_file,
            remote_key,
        })
    }

    /// Build a manifest record (v1 or v2) and derive its remote key.
    pub fn new_meta(
        scheme: &KeyScheme,
        identity: &NodeIdentity,
        version2: bool,
        time: DateTime<Utc>,
        meta_name: &str,
    ) -> Self {
        let time = crate::clock::truncate_to_minute(time);
        let (file_type, remote_key) = if version2 {
            (
                BackupFileType::MetaV2,
                scheme.meta_v2_key(&identity.token, time, meta_name),
            )
        } else {
            (
                BackupFileType::Meta,
                scheme.meta_v1_key(&identity.token, time),
            )
        };
        Self {
            file_type,
            cluster_name: identity.cluster_name.clone(),
            keyspace: None,
            column_family: None,
            token: identity.token.clone(),
            region: identity.region.clone(),
            time,
            file_name: meta_name.to_string(),
            size: 0,
            compressed_size: 0,
            last_modified: time,
            uploaded_at: None,
            local_file: None,
            remote_key,
        }
    }

    /// Inverse of the encoders: rebuild a record from a well-formed key.
    ///
    /// The region is not embedded in keys; the caller supplies it.
    pub fn decode(scheme: &KeyScheme, key: &str, region: &str) -> Result<Self> {
        let malformed = |why: &str| StelaError::MalformedKey(format!("{why}: '{key}'"));
        let (token, rest) = scheme.strip_token_segments(key)?;
        let cluster_name = scheme.app_name.clone();
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed("empty key segment"));
        }

        if segments[0] == "META" {
            return match segments.len() {
                // META/<yyyyMMddHHmm>/<name> — v2
                3 => {
                    let time = parse_instant(segments[1])?;
                    Ok(Self {
                        file_type: BackupFileType::MetaV2,
                        cluster_name,
                        keyspace: None,
                        column_family: None,
                        token: token.to_string(),
                        region: region.to_string(),
                        time,
                        file_name: segments[2].to_string(),
                        size: 0,
                        compressed_size: 0,
                        last_modified: time,
                        uploaded_at: None,
                        local_file: None,
                        remote_key: key.to_string(),
                    })
                }
                // META/<yyyyMMddHHmm>-meta.json — legacy v1
                2 => {
                    let instant = segments[1]
                        .strip_suffix("-meta.json")
                        .ok_or_else(|| malformed("v1 meta key must end in -meta.json"))?;
                    let time = parse_instant(instant)?;
                    Ok(Self {
                        file_type: BackupFileType::Meta,
                        cluster_name,
                        keyspace: None,
                        column_family: None,
                        token: token.to_string(),
                        region: region.to_string(),
                        time,
                        file_name: segments[1].to_string(),
                        size: 0,
                        compressed_size: 0,
                        last_modified: time,
                        uploaded_at: None,
                        local_file: None,
                        remote_key: key.to_string(),
                    })
                }
                _ => Err(malformed("unexpected META key shape")),
            };
        }

        let time = parse_instant(segments[0])?;
        let (keyspace, column_family, file_type, file_name) = match segments.len() {
            // <date>/<ks>/CL/<file>
            4 if segments[2] == "CL" => (segments[1], None, BackupFileType::Cl, segments[3]),
            // <date>/<ks>/<cf>/<TYPE>/<file>
            5 => {
                let file_type = BackupFileType::from_tag(segments[3])
                    .filter(|t| t.is_data_file() && *t != BackupFileType::Cl)
                    .ok_or_else(|| malformed("unknown data file type tag"))?;
                (segments[1], Some(segments[2]), file_type, segments[4])
            }
            _ => return Err(malformed("unexpected data key shape")),
        };

        Ok(Self {
            file_type,
            cluster_name,
            keyspace: Some(keyspace.to_string()),
            column_family: column_family.map(str::to_string),
            token: token.to_string(),
            region: region.to_string(),
            time,
            file_name: file_name.to_string(),
            size: 0,
            compressed_size: 0,
            last_modified: time,
            uploaded_at: None,
            local_file: None,
            remote_key: key.to_string(),
        })
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    pub fn with_compressed_size(mut self, compressed_size: u64) -> Self {
        self.compressed_size = compressed_size;
        self
    }

    pub fn with_uploaded_at(mut self, at: DateTime<Utc>) -> Self {
        self.uploaded_at = Some(at);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Where this file is placed on restore.
    ///
    /// Data files land under `<data_dir>/<ks>/<cf>/`, commit logs under the
    /// commit-log directory, manifests are never placed locally.
    pub fn restore_target(&self, data_dir: &Path, commit_log_dir: &Path) -> Option<PathBuf> {
        match self.file_type {
            BackupFileType::Cl => Some(commit_log_dir.join(&self.file_name)),
            BackupFileType::Snap | BackupFileType::Sst => {
                let ks = self.keyspace.as_deref()?;
                let cf = self.column_family.as_deref()?;
                Some(data_dir.join(ks).join(cf).join(&self.file_name))
            }
            BackupFileType::Meta | BackupFileType::MetaV2 => None,
        }
    }
}

impl PartialEq for BackupPath {
    fn eq(&self, other: &Self) -> bool {
        self.remote_key == other.remote_key
    }
}

impl Eq for BackupPath {}

impl PartialOrd for BackupPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackupPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.remote_key.cmp(&other.remote_key)
    }
}

impl std::hash::Hash for BackupPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.remote_key.hash(state);
    }
}

/// Common name of an SSTable's components: everything before the last `-`.
///
/// `mc-1-big-Data.db` → `mc-1-big`; returns `None` when the name has no `-`.
pub fn sstable_base_name(file_name: &str) -> Option<&str> {
    file_name.rfind('-').map(|idx| &file_name[..idx])
}
