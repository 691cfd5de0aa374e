//! Error types for swiftdl core

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while running a transfer
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: server returned {status}")]
    Http { status: u16 },

    #[error("Timeout: no completion within {0:?}")]
    Timeout(Duration),

    #[error("Engine not initialized: call start() first")]
    NotInitialized,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Engine shut down")]
    ShutDown,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DownloadError {
    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::Io(_) | DownloadError::Timeout(_) => true,
            DownloadError::Http { status } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Whether this is a status the server chose, as opposed to a transport fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, DownloadError::Http { status } if (400..500).contains(status))
    }

    /// HTTP status carried by the error, 0 when no response was received
    pub fn status_code(&self) -> u16 {
        match self {
            DownloadError::Http { status } => *status,
            DownloadError::Network(e) => e.status().map(|s| s.as_u16()).unwrap_or(0),
            _ => 0,
        }
    }
}

// Allow converting to String for UI layers
impl From<DownloadError> for String {
    fn from(error: DownloadError) -> Self {
        error.to_string()
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}
