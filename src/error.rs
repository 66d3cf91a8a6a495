//! Error types for the chat synchronization core
//!
//! Every fallible operation in the crate returns `SyncError`. Transport and
//! timestamp problems are recovered locally and rarely reach callers; the
//! variants below are what survives to the boundary.

use thiserror::Error;

/// Substrings (lowercase) that mark a failure reason as an authorization problem
const AUTH_FAILURE_KEYWORDS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "expired",
    "invalid token",
    "jwt",
    "401",
    "403",
];

/// Synchronization-level error types
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or channel failure (connect, read, disconnect)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential was rejected by the server
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Server answered with a non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body (or a placeholder when unreadable)
        body: String,
    },

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Credential refresh failed; automatic retries have stopped
    #[error("Session expired")]
    SessionExpired,

    /// An operation needed a selected conversation but none is active
    #[error("No active conversation")]
    NoActiveConversation,

    /// No optimistic placeholder with the given temp id exists
    #[error("Unknown placeholder: {0}")]
    UnknownPlaceholder(String),

    /// Delivery status change not allowed by the send lifecycle
    #[error("Invalid delivery transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Configuration value is missing or out of range
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error (catch-all for unexpected errors)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether this error should trigger a credential refresh
    pub fn is_authorization_failure(&self) -> bool {
        match self {
            SyncError::Unauthorized(_) => true,
            SyncError::Http { status, body } => {
                *status == 401 || *status == 403 || is_authorization_reason(body)
            }
            SyncError::Transport(reason) => is_authorization_reason(reason),
            _ => false,
        }
    }
}

/// Inspect a server-provided failure reason for authorization keywords
///
/// Matching is case-insensitive.
pub fn is_authorization_reason(reason: &str) -> bool {
    let lowered = reason.to_lowercase();
    AUTH_FAILURE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return SyncError::Unauthorized(e.to_string());
            }
        }
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

/// Result alias used across the crate
pub type SyncResult<T> = Result<T, SyncError>;
