use std::path::{Path, PathBuf};

use super::types::StelaConfig;
use crate::error::{Result, StelaError};

/// Environment variable overriding the default config search.
pub const CONFIG_ENV: &str = "STELA_CONFIG";

/// Locate the configuration file: explicit flag, then `$STELA_CONFIG`,
/// then `./stela.yaml`, then `/etc/stela/config.yaml`.
pub fn resolve_config_path(flag: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    for candidate in ["./stela.yaml", "/etc/stela/config.yaml"] {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    Err(StelaError::Config(
        "no configuration file found; pass --config, set STELA_CONFIG, \
         or create ./stela.yaml"
            .into(),
    ))
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<StelaConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StelaError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let config: StelaConfig = serde_yaml::from_str(&raw).map_err(|e| {
        StelaError::Config(format!("cannot parse config '{}': {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = "\
store:
  url: /tmp/stela-store
app_name: Test
token: \"100\"
backup_location: b
backup_prefix: p
data_file_location: /var/lib/columnar/data
commit_log_location: /var/lib/columnar/commitlog
";

    #[test]
    fn minimal_yaml_loads_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.backup_prefix, "p");
        assert_eq!(cfg.max_concurrent_files, 4);
        assert_eq!(cfg.compression_codec, "snappy");
        assert!(cfg.incremental_enabled);
        assert_eq!(cfg.upload_rate_bytes_per_sec, 0);
    }

    #[test]
    fn missing_required_field_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"store:\n  url: /tmp/s\napp_name: Test\n")
            .unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(StelaError::Config(_))
        ));
    }

    #[test]
    fn invalid_value_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        file.write_all(b"max_concurrent_files: 0\n").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(StelaError::Config(_))
        ));
    }

    #[test]
    fn explicit_flag_wins() {
        let path = resolve_config_path(Some("/etc/custom/stela.yaml")).unwrap();
        assert_eq!(path, PathBuf::from("/etc/custom/stela.yaml"));
    }
}
