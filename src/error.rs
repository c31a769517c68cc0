//! Error types for claimlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error: {0}")]
    Telegram(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rejections reported back over the configuration link.
///
/// None of these advance the state machine; the peer may resubmit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid owner identity: {0}")]
    InvalidOwnerIdentity(String),

    #[error("credential verification failed")]
    CredentialVerificationFailed,

    #[error("credential verification timed out")]
    VerificationTimedOut,

    #[error("device is already paired")]
    AlreadyPaired,
}

impl ConfigError {
    /// Status string published on the link for this rejection
    pub fn status_code(&self) -> &'static str {
        match self {
            ConfigError::InvalidPayload(_) => "error_invalid_payload",
            ConfigError::InvalidOwnerIdentity(_) => "error_invalid_owner",
            ConfigError::CredentialVerificationFailed => "error_wifi_failed",
            ConfigError::VerificationTimedOut => "error_wifi_timeout",
            ConfigError::AlreadyPaired => "error_already_paired",
        }
    }
}
