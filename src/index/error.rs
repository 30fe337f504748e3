use std::sync::Arc;
use thiserror::Error;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors raised by the index builders, readers and remote back-ends
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Malformed archive: {0}")]
    MalformedArchive(#[source] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Range requests not supported by {0}")]
    RangeNotSupported(String),

    #[error("Tree API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid index record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    /// Error produced once and handed to several waiters (range block cache)
    #[error(transparent)]
    Shared(Arc<IndexError>),
}

impl IndexError {
    /// Whether the caller gave up, as opposed to the data being unavailable
    pub fn is_cancelled(&self) -> bool {
        match self {
            IndexError::Cancelled | IndexError::DeadlineExceeded => true,
            IndexError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Whether the operation was called off through its cancel signal.
    /// A passed deadline is not included: the data may still be on its way.
    pub fn is_cancel_signal(&self) -> bool {
        match self {
            IndexError::Cancelled => true,
            IndexError::Shared(inner) => inner.is_cancel_signal(),
            _ => false,
        }
    }

    /// Convert to POSIX errno
    pub fn to_errno(&self) -> i32 {
        match self {
            IndexError::NotFound(_) => libc::ENOENT,
            IndexError::NotADirectory(_) => libc::ENOTDIR,
            IndexError::IsADirectory(_) => libc::EISDIR,
            IndexError::InvalidPath(_) => libc::EINVAL,
            IndexError::Cancelled => libc::EINTR,
            IndexError::DeadlineExceeded => libc::ETIMEDOUT,
            IndexError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            IndexError::Shared(inner) => inner.to_errno(),
            IndexError::MalformedArchive(_)
            | IndexError::Store(_)
            | IndexError::Http(_)
            | IndexError::RangeNotSupported(_)
            | IndexError::Api(_)
            | IndexError::Json(_) => libc::EIO,
        }
    }
}

impl From<sqlx::migrate::MigrateError> for IndexError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IndexError::Store(err.into())
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::Io(std::io::Error::other(err))
    }
}
