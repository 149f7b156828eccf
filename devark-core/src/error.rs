//! Error types for devark-core

use thiserror::Error;

/// Main error type for the devark-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (Cursor state.vscdb access)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error for tool data (composer blobs, transcripts, LLM output)
    #[error("parse error in {tool} data: {message}")]
    Parse { tool: String, message: String },

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Authentication error (missing token, failed decrypt, backend 401)
    #[error("auth error: {0}")]
    Auth(String),

    /// Quota exceeded (saved-prompt cap and friends)
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Rejected at the API surface
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Cloud sync error
    #[error("sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether this error is transient and worth retrying within a component.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Sync(msg) | Error::Llm(msg) => {
                msg.contains("timeout")
                    || msg.contains("connection")
                    || msg.contains("request failed")
                    || (msg.contains("API error") && msg.contains("50"))
            }
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
            }
            _ => false,
        }
    }
}

/// Result type alias for devark-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Sync("API error (503): unavailable".to_string()).is_retryable());
        assert!(Error::Sync("HTTP request failed: timeout".to_string()).is_retryable());
        assert!(!Error::Sync("API error (401): unauthorized".to_string()).is_retryable());
        assert!(!Error::Auth("token missing".to_string()).is_retryable());
        assert!(!Error::InvalidInput("empty token".to_string()).is_retryable());
    }
}
