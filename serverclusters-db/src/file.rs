use crate::{Result, StorageError, ValueStorage, validate_store_name};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Flat-file store: a single json object per logical store, mirrored in memory.
///
/// Reads are served from memory. Every write rewrites the whole file through
/// a temporary sibling and a rename, so the file on disk is always complete.
pub struct FileStorage {
  name: String,
  path: PathBuf,
  values: RwLock<HashMap<Uuid, String>>,
  closed: AtomicBool,
}

impl FileStorage {
  /// Open `<dir>/<name>.json`, creating `dir` if needed. A missing file is an
  /// empty store.
  pub async fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
    validate_store_name(name)?;
    let dir = dir.as_ref();
    if !dir.as_os_str().is_empty() {
      tokio::fs::create_dir_all(dir).await?;
    }
    let path = dir.join(format!("{name}.json"));

    let values = match tokio::fs::read(&path).await {
      Ok(bytes) if bytes.is_empty() => HashMap::new(),
      Ok(bytes) => serde_json::from_slice(&bytes)?,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
      Err(err) => return Err(err.into()),
    };

    info!(store = name, path = %path.display(), entries = values.len(), "file storage opened");
    Ok(Self {
      name: name.to_string(),
      path,
      values: RwLock::new(values),
      closed: AtomicBool::new(false),
    })
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(StorageError::Closed);
    }
    Ok(())
  }

  async fn persist(&self, values: &HashMap<Uuid, String>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(values)?;
    let tmp = self.path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &self.path).await?;
    Ok(())
  }
}

#[async_trait]
impl ValueStorage for FileStorage {
  fn name(&self) -> &str {
    &self.name
  }

  async fn get(&self, key: Uuid) -> Result<Option<String>> {
    self.ensure_open()?;
    Ok(self.values.read().await.get(&key).cloned())
  }

  async fn put(&self, key: Uuid, value: String) -> Result<()> {
    self.ensure_open()?;
    // Held across the file write so concurrent puts hit the disk in order.
    let mut values = self.values.write().await;
    let previous = values.insert(key, value);
    if let Err(err) = self.persist(&values).await {
      match previous {
        Some(previous) => values.insert(key, previous),
        None => values.remove(&key),
      };
      return Err(err);
    }

    debug!(store = %self.name, %key, "stored value");
    Ok(())
  }

  async fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      info!(store = %self.name, "file storage closed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), "logoutserver_survival")
      .await
      .unwrap();
    assert!(storage.get(Uuid::new_v4()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let player = Uuid::new_v4();

    let storage = FileStorage::open(dir.path(), "logoutserver_survival")
      .await
      .unwrap();
    storage.put(player, "s2".to_string()).await.unwrap();
    storage.close().await;

    let storage = FileStorage::open(dir.path(), "logoutserver_survival")
      .await
      .unwrap();
    assert_eq!(storage.get(player).await.unwrap().as_deref(), Some("s2"));
    assert!(dir.path().join("logoutserver_survival.json").exists());
    assert!(!dir.path().join("logoutserver_survival.json.tmp").exists());
  }

  #[tokio::test]
  async fn test_corrupt_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("logoutserver_survival.json"), b"{not json").unwrap();

    let result = FileStorage::open(dir.path(), "logoutserver_survival").await;
    assert!(matches!(result, Err(StorageError::Corrupt(_))));
  }

  #[tokio::test]
  async fn test_closed_storage_rejects_access() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path(), "logoutserver_survival")
      .await
      .unwrap();
    storage.close().await;
    storage.close().await;

    assert!(matches!(
      storage.put(Uuid::new_v4(), "s1".to_string()).await,
      Err(StorageError::Closed)
    ));
  }
}
