//! Unified error handling for the device host.

use crate::config::ConfigError;

/// Device host error type.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Engine(#[from] msync_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored data is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid input: {0}")]
    BadRequest(String),
}

impl DeviceError {
    /// The bundle could not be opened with the given passphrase.
    pub fn is_bad_passphrase(&self) -> bool {
        matches!(
            self,
            DeviceError::Engine(msync_engine::Error::IncorrectPassphrase)
        )
    }

    /// The file is not a readable bundle.
    pub fn is_invalid_bundle(&self) -> bool {
        matches!(
            self,
            DeviceError::Engine(msync_engine::Error::InvalidBundle(_))
        )
    }
}

/// Result type alias for the device host.
pub type Result<T> = std::result::Result<T, DeviceError>;
