use thiserror::Error;

pub type Result<T> = std::result::Result<T, StelaError>;

#[derive(Debug, Error)]
pub enum StelaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed remote key: {0}")]
    MalformedKey(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    #[error("permanent remote error: {0}")]
    RemotePermanent(String),

    #[error("corrupt compressed stream: {0}")]
    CorruptCompressed(String),

    #[error("no manifest found for token '{token}' at or before {at}")]
    ManifestNotFound { token: String, at: String },

    #[error("manifest references unavailable data: {0}")]
    ManifestBroken(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database control channel error: {0}")]
    DbControl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StelaError {
    /// Whether the retry loop is allowed to attempt the operation again.
    ///
    /// Local read failures are retryable: the common cause is the database
    /// compacting a file away mid-read, and the next attempt re-stats it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StelaError::RemoteTransient(_) | StelaError::LocalIo(_) | StelaError::Timeout(_)
        )
    }
}
