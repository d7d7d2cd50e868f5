use std::time::Duration;

use crate::error::{Result, StelaError};

pub(super) fn default_backup_prefix() -> String {
    "backups".to_string()
}

pub(super) fn default_region() -> String {
    "us-east-1".to_string()
}

pub(super) fn default_incremental_enabled() -> bool {
    true
}

pub(super) fn default_concurrency() -> usize {
    4
}

pub(super) fn default_codec() -> String {
    "snappy".to_string()
}

pub(super) fn default_retry_attempts() -> u32 {
    4
}

pub(super) fn default_retry_base_delay() -> String {
    "500ms".to_string()
}

pub(super) fn default_file_timeout() -> String {
    "30m".to_string()
}

pub(super) fn default_round_timeout() -> String {
    "6h".to_string()
}

pub(super) fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

pub(super) fn default_multipart_part_size() -> u64 {
    8 * 1024 * 1024
}

/// Parse a duration string like "500ms", "30s", "5m", "2h", "1d".
/// Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StelaError::Config("empty duration string".into()));
    }
    if let Ok(n) = s.parse::<u64>() {
        return Ok(Duration::from_secs(n));
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| StelaError::Config(format!("invalid duration: '{s}'")))?;
    let (num, suffix) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| StelaError::Config(format!("invalid duration number: '{num}'")))?;
    match suffix {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        "d" => Ok(Duration::from_secs(n * 86_400)),
        other => Err(StelaError::Config(format!(
            "unknown duration suffix: '{other}'"
        ))),
    }
}
