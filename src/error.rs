//! Error types for the monitor.

use thiserror::Error;

/// Main error type for monitor operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport unavailable before the channel opened. Triggers the polling
    /// fallback, not a reconnect.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Socket-level error after the channel opened.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Malformed frame or unexpected wire content. Logged and dropped, the
    /// channel stays open.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The backend rejected our session. Always escalates to a full reauth.
    #[error("Authentication expired")]
    AuthExpired,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    MaxAttemptsExceeded { attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("State file is locked by another process")]
    Locked,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Serialization(e.to_string())
    }
}

/// Result type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
