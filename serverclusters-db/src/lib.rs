mod error;
mod file;
mod sqlite;

pub use error::{Result, StorageError};
pub use file::FileStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Durable key/value store keyed by player id.
///
/// Implementations must tolerate concurrent `get` calls; `close` must be
/// idempotent and every call after it fails with [`StorageError::Closed`].
#[async_trait]
pub trait ValueStorage: Send + Sync {
  /// Logical name of the store (table or file stem), used for logging.
  fn name(&self) -> &str;

  async fn get(&self, key: Uuid) -> Result<Option<String>>;

  async fn put(&self, key: Uuid, value: String) -> Result<()>;

  async fn close(&self);
}

/// Which persistence engine backs the affinity stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
  Sqlite,
  File,
}

impl FromStr for Backend {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "sqlite" | "sql" | "mysql" => Ok(Backend::Sqlite),
      "file" | "yaml" | "json" => Ok(Backend::File),
      other => Err(format!("unknown storage backend '{other}'")),
    }
  }
}

/// Store names end up in SQL identifiers and file names, so only a
/// conservative character set is accepted.
pub fn validate_store_name(name: &str) -> Result<()> {
  if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(StorageError::InvalidName(name.to_string()));
  }
  Ok(())
}

/// Open the store `name` on the configured backend.
///
/// `location` is the database file for [`Backend::Sqlite`] and the directory
/// holding the json files for [`Backend::File`]. When the relational store
/// cannot be opened the flat-file store next to it is used instead.
pub async fn open_storage(
  backend: Backend,
  location: impl AsRef<Path>,
  name: &str,
) -> Result<Arc<dyn ValueStorage>> {
  let location = location.as_ref();
  if backend == Backend::Sqlite {
    match SqliteStorage::open(location, name).await {
      Ok(storage) => return Ok(Arc::new(storage)),
      Err(StorageError::InvalidName(name)) => return Err(StorageError::InvalidName(name)),
      Err(err) => {
        warn!(store = name, error = %err, "sqlite storage unavailable, falling back to file storage");
      }
    }
  }

  let dir = match backend {
    Backend::File => location.to_path_buf(),
    Backend::Sqlite => location
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default(),
  };
  Ok(Arc::new(FileStorage::open(dir, name).await?))
}
