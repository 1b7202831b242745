use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("storage file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("invalid storage name '{0}' (only ascii letters, digits and underscore allowed)")]
    InvalidName(String),

    #[error("storage already closed")]
    Closed,
}

impl StorageError {
    /// Whether this failure means the medium could not be reached, as opposed
    /// to a configuration mistake. Callers treat these as a cache miss.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, StorageError::InvalidName(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
