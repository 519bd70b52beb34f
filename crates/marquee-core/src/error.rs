//! Error types for Marquee Core

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Session errors
    #[error("Failed to create session: {0}")]
    SessionCreateFailed(String),

    #[error("Failed to load session info: {0}")]
    SessionInfoFailed(String),

    // Manifest errors
    #[error("Network error: {message}")]
    ManifestNetwork { message: String, detail: String },

    #[error("Media error: {message}")]
    ManifestMedia { message: String, detail: String },

    #[error("Stream did not become ready within {seconds}s")]
    StartupTimeout { seconds: u64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // Subtitle errors
    #[error("Subtitle fetch aborted")]
    SubtitleFetchAborted,

    #[error("Subtitle fetch failed: {0}")]
    SubtitleFetchFailed(String),

    // Watch party errors
    #[error("Watch party not found")]
    PartyNotFound,

    #[error("Watch party has expired")]
    PartyExpired,

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if retrying the whole session setup may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ManifestNetwork { .. }
                | Error::ManifestMedia { .. }
                | Error::StartupTimeout { .. }
                | Error::Network(_)
        )
    }

    /// Returns true if the error is an expected cancellation that
    /// callers should swallow rather than surface
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::SubtitleFetchAborted)
    }

    /// Human-readable message/detail pair for fatal playback failures
    pub fn message_detail(&self) -> (String, String) {
        match self {
            Error::ManifestNetwork { message, detail } => (message.clone(), detail.clone()),
            Error::ManifestMedia { message, detail } => (message.clone(), detail.clone()),
            other => ("Failed to load stream".to_string(), other.to_string()),
        }
    }

    /// Returns the error code for telemetry
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::SessionCreateFailed(_) => "SESSION_CREATE",
            Error::SessionInfoFailed(_) => "SESSION_INFO",
            Error::ManifestNetwork { .. } => "MANIFEST_NETWORK",
            Error::ManifestMedia { .. } => "MANIFEST_MEDIA",
            Error::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::SubtitleFetchAborted => "SUBTITLE_ABORTED",
            Error::SubtitleFetchFailed(_) => "SUBTITLE_FETCH",
            Error::PartyNotFound => "PARTY_NOT_FOUND",
            Error::PartyExpired => "PARTY_EXPIRED",
            Error::Network(_) => "NETWORK",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Internal(_) => "INTERNAL",
        }
    }
}
