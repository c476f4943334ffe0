//! Errors surfaced to pages.
//!
//! Every failure that reaches a page is one of these kinds. Plumbing errors
//! (file I/O, process spawn, JSON) travel as `anyhow::Error` until they hit a
//! component boundary, where they are converted into the matching kind.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("No text provided")]
    NoText,

    #[error("API key not configured")]
    CredentialMissing,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Audio playback failed: {0}")]
    PlaybackFailed(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl ReadError {
    /// Stable kind code carried on the bus.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadError::NoText => "no-text",
            ReadError::CredentialMissing => "credential-missing",
            ReadError::Network(_) => "network-error",
            ReadError::EngineUnavailable(_) => "engine-unavailable",
            ReadError::PlaybackFailed(_) => "playback-failed",
            ReadError::UnknownAction(_) => "unknown-action",
        }
    }

    /// Whether a fallback engine may be tried after this error.
    pub fn is_transport(&self) -> bool {
        matches!(self, ReadError::Network(_))
    }

    /// Message shown in the on-page notification.
    pub fn user_message(&self) -> String {
        match self {
            ReadError::NoText => "Nothing to read: select some text first.".to_string(),
            ReadError::CredentialMissing => {
                "Add an API key in the options to use the remote voice.".to_string()
            }
            ReadError::Network(detail) => format!("Could not reach the speech service ({detail})."),
            ReadError::EngineUnavailable(detail) => {
                format!("Speech engine unavailable: {}", first_line(detail))
            }
            ReadError::PlaybackFailed(detail) => {
                format!("Audio playback failed: {}", first_line(detail))
            }
            ReadError::UnknownAction(action) => format!("Unsupported request: {action}"),
        }
    }

    pub fn engine_unavailable(err: impl std::fmt::Display) -> Self {
        ReadError::EngineUnavailable(err.to_string())
    }

    pub fn playback(err: impl std::fmt::Display) -> Self {
        ReadError::PlaybackFailed(err.to_string())
    }
}

fn first_line(detail: &str) -> &str {
    detail.lines().next().unwrap_or(detail).trim()
}

impl From<reqwest::Error> for ReadError {
    fn from(err: reqwest::Error) -> Self {
        ReadError::Network(err.without_url().to_string())
    }
}
