use serde::Serialize;
use thiserror::Error;

/// Failure classes every component boundary converts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, stream resets, "unavailable". Retried by the connection monitor.
    Transient,
    /// Remote rejected the operation for good (not-found, conflict, ...).
    Permanent,
    /// Caller is not in a state to perform the operation (unauthenticated).
    Precondition,
    /// Payload rejected before reaching the remote store or the queue.
    Validation,
    /// Local storage engine failure (quota, corruption, queue full).
    CacheUnavailable,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transient remote error: {0}")]
    Transient(String),

    #[error("Remote error: {0}")]
    Permanent(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transient => SyncError::Transient(message),
            ErrorKind::Permanent => SyncError::Permanent(message),
            ErrorKind::Precondition => SyncError::Precondition(message),
            ErrorKind::Validation => SyncError::Validation(message),
            ErrorKind::CacheUnavailable => SyncError::CacheUnavailable(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::Permanent(_) => ErrorKind::Permanent,
            SyncError::Precondition(_) => ErrorKind::Precondition,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::CacheUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::CacheUnavailable(err.to_string())
    }
}
