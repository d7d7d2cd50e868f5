pub mod backup;
pub mod daemon;
pub mod list;
pub mod restore;

use stela_core::clock::SystemClock;
use stela_core::config::StelaConfig;
use stela_core::dbcontrol::SerializedDbControl;
use stela_core::error::{Result, StelaError};
use stela_core::fingerprint::UploadFingerprintCache;
use stela_core::status::StatusRegistry;
use stela_core::storage::{store_from_config, ObjectStore};

use crate::db_adapter::ShellDbControl;

/// Everything a subcommand needs, assembled once from configuration.
pub struct Runtime {
    pub config: StelaConfig,
    pub store: Box<dyn ObjectStore>,
    pub db: SerializedDbControl<ShellDbControl>,
    pub clock: SystemClock,
    pub registry: StatusRegistry,
    pub cache: UploadFingerprintCache,
}

impl Runtime {
    pub fn new(config: StelaConfig) -> Result<Self> {
        let store = store_from_config(&config)?;
        Ok(Self {
            config,
            store,
            db: SerializedDbControl::new(ShellDbControl::from_env()),
            clock: SystemClock,
            registry: StatusRegistry::default(),
            cache: UploadFingerprintCache::new(),
        })
    }
}

/// Map an error kind onto the documented process exit codes:
/// 2 configuration, 3 manifest not found, 4 permanent store failure,
/// 1 anything else.
pub fn exit_code(e: &StelaError) -> i32 {
    match e {
        StelaError::Config(_) => 2,
        StelaError::ManifestNotFound { .. } => 3,
        StelaError::RemotePermanent(_) | StelaError::ManifestBroken(_) => 4,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(exit_code(&StelaError::Config("x".into())), 2);
        assert_eq!(
            exit_code(&StelaError::ManifestNotFound {
                token: "100".into(),
                at: "t".into()
            }),
            3
        );
        assert_eq!(exit_code(&StelaError::RemotePermanent("403".into())), 4);
        assert_eq!(exit_code(&StelaError::Cancelled), 1);
    }
}
