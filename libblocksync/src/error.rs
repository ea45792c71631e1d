use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to fetch domain list from {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },
    #[error("Domain list is unusable: {0}")]
    SourceFormat(String),
    #[error("Invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },
    #[error("Admin API rejected credentials (HTTP {status})")]
    Auth { status: u16 },
    #[error("Admin API request failed: {0}")]
    Remote(String),
    #[error("Domain is already blocked: {0}")]
    AlreadyExists(String),
    #[error("Block entry not found: {0}")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Copyable projection of [`SyncError`] kept in summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    SourceFormat,
    InvalidDomain,
    Auth,
    Remote,
    AlreadyExists,
    NotFound,
    Config,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            SyncError::SourceFormat(_) => ErrorKind::SourceFormat,
            SyncError::InvalidDomain { .. } => ErrorKind::InvalidDomain,
            SyncError::Auth { .. } => ErrorKind::Auth,
            SyncError::Remote(_) => ErrorKind::Remote,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Config(_) => ErrorKind::Config,
        }
    }

    /// Errors that end the whole run rather than a single domain operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SourceUnavailable | ErrorKind::SourceFormat | ErrorKind::Auth | ErrorKind::Config
        )
    }
}
