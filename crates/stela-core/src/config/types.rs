use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::backup_path::{KeyScheme, NodeIdentity};
use crate::compress::Codec;
use crate::error::{Result, StelaError};
use crate::storage::{MultipartConfig, RetryPolicy};

/// The whole sidecar configuration, loaded from YAML.
///
/// Identity (token, region) normally comes from the cluster-identity
/// subsystem; the sidecar consumes it here as plain fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StelaConfig {
    /// Object-store driver settings.
    pub store: StoreConfig,

    /// Cluster name; reversed into every remote key.
    pub app_name: String,

    /// This node's position on the ring.
    pub token: String,

    #[serde(default = "default_region")]
    pub instance_region: String,

    /// Top-level key component (bucket or root).
    pub backup_location: String,

    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,

    /// Database data directory, `<dataDir>/<ks>/<cf>/...`.
    pub data_file_location: String,

    pub commit_log_location: String,

    /// Cron expression or `every <duration>`; absent disables the driver.
    #[serde(default)]
    pub snapshot_schedule: Option<String>,

    #[serde(default = "default_incremental_enabled")]
    pub incremental_enabled: bool,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_files: usize,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_restores: usize,

    /// Zero means unlimited.
    #[serde(default)]
    pub upload_rate_bytes_per_sec: u64,

    /// `snappy` | `lzf` | `none`.
    #[serde(default = "default_codec")]
    pub compression_codec: String,

    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: String,

    /// Upper bound on one file's retries, `30m` by default.
    #[serde(default = "default_file_timeout")]
    pub file_timeout: String,

    #[serde(default = "default_round_timeout")]
    pub round_timeout: String,

    /// Manifests older than this are pruned after a round; zero keeps all.
    #[serde(default)]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL: bare path, `file://`, `s3://`, or `s3+http://`.
    pub url: String,
    /// S3 region (default us-east-1).
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl StelaConfig {
    /// Reject configurations the pipeline cannot run with. Called once at
    /// startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        fn required(name: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(StelaError::Config(format!("{name} must be set")));
            }
            Ok(())
        }
        required("store.url", &self.store.url)?;
        required("app_name", &self.app_name)?;
        required("token", &self.token)?;
        required("backup_location", &self.backup_location)?;
        required("data_file_location", &self.data_file_location)?;
        required("commit_log_location", &self.commit_log_location)?;
        for (name, value) in [("app_name", &self.app_name), ("token", &self.token)] {
            if value.contains('/') {
                return Err(StelaError::Config(format!(
                    "{name} must not contain '/': '{value}'"
                )));
            }
        }
        if self.max_concurrent_files == 0 {
            return Err(StelaError::Config("max_concurrent_files must be >= 1".into()));
        }
        if self.max_concurrent_restores == 0 {
            return Err(StelaError::Config(
                "max_concurrent_restores must be >= 1".into(),
            ));
        }
        if self.multipart_part_size == 0 {
            return Err(StelaError::Config("multipart_part_size must be > 0".into()));
        }
        Codec::from_config(&self.compression_codec)?;
        parse_duration(&self.retry_base_delay)?;
        parse_duration(&self.file_timeout)?;
        parse_duration(&self.round_timeout)?;
        if let Some(schedule) = &self.snapshot_schedule {
            crate::scheduler::Schedule::parse(schedule)?;
        }
        Ok(())
    }

    pub fn codec(&self) -> Codec {
        Codec::from_config(&self.compression_codec).expect("validated at startup")
    }

    pub fn key_scheme(&self) -> KeyScheme {
        KeyScheme::new(&self.backup_location, &self.backup_prefix, &self.app_name)
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            cluster_name: self.app_name.clone(),
            token: self.token.clone(),
            region: self.instance_region.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            base_delay: parse_duration(&self.retry_base_delay).expect("validated at startup"),
            ..RetryPolicy::default()
        }
    }

    pub fn multipart_config(&self) -> MultipartConfig {
        MultipartConfig {
            threshold: self.multipart_threshold,
            min_part_size: self.multipart_part_size,
            ..MultipartConfig::default()
        }
    }

    pub fn file_timeout_duration(&self) -> Duration {
        parse_duration(&self.file_timeout).expect("validated at startup")
    }

    pub fn round_timeout_duration(&self) -> Duration {
        parse_duration(&self.round_timeout).expect("validated at startup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_config;

    #[test]
    fn valid_config_passes() {
        test_config("/tmp/store", "/tmp/data", "/tmp/cl")
            .validate()
            .unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = test_config("/tmp/store", "/tmp/data", "/tmp/cl");
        cfg.max_concurrent_files = 0;
        assert!(matches!(cfg.validate(), Err(StelaError::Config(_))));
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut cfg = test_config("/tmp/store", "/tmp/data", "/tmp/cl");
        cfg.compression_codec = "brotli".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slash_in_token_is_rejected() {
        let mut cfg = test_config("/tmp/store", "/tmp/data", "/tmp/cl");
        cfg.token = "10/0".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_schedule_is_rejected() {
        let mut cfg = test_config("/tmp/store", "/tmp/data", "/tmp/cl");
        cfg.snapshot_schedule = Some("whenever".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scheme_and_identity_derive_from_fields() {
        let cfg = test_config("/tmp/store", "/tmp/data", "/tmp/cl");
        assert_eq!(cfg.key_scheme().token_prefix("100"), "b/p/tseT/100");
        assert_eq!(cfg.identity().cluster_name, "Test");
    }
}
