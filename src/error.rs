use std::time::Duration;

use thiserror::Error;

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedEntry(format!("JSON error: {}", err))
    }
}

impl From<sqlx::Error> for SentinelError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SentinelError {
    fn from(err: reqwest::Error) -> Self {
        Self::ChangelogSource(format!("HTTP error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Changelog no longer contains committed serial {serial}; history was truncated")]
    LogContinuity { serial: i64 },

    #[error("Malformed changelog entry: {0}")]
    MalformedEntry(String),

    #[error("Failed to commit signed entry: {0}")]
    SignCommit(String),

    #[error("Stale entry {serial}: already committed up to {current}")]
    StaleEntry { serial: i64, current: i64 },

    #[error("Line {line} failed verification: included tag {included}, computed {computed} (at step {step})")]
    ChainVerificationMismatch {
        line: usize,
        included: String,
        computed: String,
        step: usize,
    },

    #[error("Malformed log line {line}: {reason}")]
    MalformedLogLine { line: usize, reason: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Insufficient shares: {supplied} supplied, {required} required")]
    InsufficientShares { required: usize, supplied: usize },

    #[error("Invalid share: {0}")]
    InvalidShare(String),

    #[error("Hardware token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Hardware token declined: {0}")]
    TokenDeclined(String),

    #[error("Hardware token did not respond within {0:?}")]
    TokenTimeout(Duration),

    #[error("Audit log already initialized")]
    AlreadyInitialized,

    #[error("Audit log not initialized; run init-audit-log first")]
    NotInitialized,

    #[error("Share encryption failed: {0}")]
    ShareEncryption(String),

    #[error("Changelog source error: {0}")]
    ChangelogSource(String),

    #[error("Projection update failed: {0}")]
    Projection(String),

    #[error("Invalid distinguished name: {0}")]
    DirectoryName(String),
}

impl SentinelError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEntry(msg.into())
    }

    pub fn projection(msg: impl Into<String>) -> Self {
        Self::Projection(msg.into())
    }

    /// Errors that terminate the current ingestion pass but leave the
    /// committed state untouched; the next poll tick retries.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedEntry(_)
                | Self::SignCommit(_)
                | Self::DatabaseError(_)
                | Self::Io(_)
                | Self::ChangelogSource(_)
        )
    }

    /// Errors that need an operator before the chain can be extended.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::LogContinuity { .. } | Self::SignCommit(_))
    }
}
