// src/error.rs

//! Error types for the repository synchronization engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the sync engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("GPG verification failed: {0}")]
    GpgVerificationFailed(String),

    #[error("Signing failed: {0}")]
    SigningError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Mirrors locked: {0}")]
    MirrorsLocked(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("QA failure: {0}")]
    QaError(String),

    #[error(transparent)]
    Compression(#[from] crate::compression::CompressionError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a later run may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DownloadError(_) | Self::MirrorsLocked(_) | Self::Cancelled(_)
        )
    }

    /// Whether the error indicates untrusted or corrupt data
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::GpgVerificationFailed(_) | Self::Compression(_)
        )
    }
}
