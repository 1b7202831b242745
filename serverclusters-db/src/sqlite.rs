use crate::{Result, StorageError, ValueStorage, validate_store_name};

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

/// Relational store: one table per logical store inside a SQLite database.
pub struct SqliteStorage {
  conn: Connection,
  table: String,
  closed: AtomicBool,
}

impl SqliteStorage {
  /// Open or create the database at `path` and make sure `table` exists.
  pub async fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
    validate_store_name(table)?;
    let conn = Connection::open(path).await.map_err(StorageError::Sqlite)?;
    let storage = Self {
      conn,
      table: table.to_string(),
      closed: AtomicBool::new(false),
    };
    storage.initialize().await?;
    Ok(storage)
  }

  /// Create an in-memory store (useful for testing).
  pub async fn open_in_memory(table: &str) -> Result<Self> {
    validate_store_name(table)?;
    let conn = Connection::open_in_memory()
      .await
      .map_err(StorageError::Sqlite)?;
    let storage = Self {
      conn,
      table: table.to_string(),
      closed: AtomicBool::new(false),
    };
    storage.initialize().await?;
    Ok(storage)
  }

  async fn initialize(&self) -> Result<()> {
    let create = format!(
      "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
      self.table
    );
    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        // WAL keeps readers from blocking on the write-through path
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(&create)?;
        Ok(())
      })
      .await?;

    info!(table = %self.table, "sqlite storage initialized");
    Ok(())
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(StorageError::Closed);
    }
    Ok(())
  }
}

#[async_trait]
impl ValueStorage for SqliteStorage {
  fn name(&self) -> &str {
    &self.table
  }

  async fn get(&self, key: Uuid) -> Result<Option<String>> {
    self.ensure_open()?;
    let query = format!("SELECT value FROM {} WHERE key = ?1", self.table);
    let value = self
      .conn
      .call(move |conn| -> rusqlite::Result<Option<String>> {
        conn
          .prepare_cached(&query)?
          .query_row(params![key.to_string()], |row| row.get(0))
          .optional()
      })
      .await?;

    Ok(value)
  }

  async fn put(&self, key: Uuid, value: String) -> Result<()> {
    self.ensure_open()?;
    let upsert = format!(
      "INSERT INTO {} (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
      self.table
    );
    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        conn
          .prepare_cached(&upsert)?
          .execute(params![key.to_string(), &value])?;
        Ok(())
      })
      .await?;

    debug!(table = %self.table, %key, "stored value");
    Ok(())
  }

  async fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Err(err) = self.conn.clone().close().await {
      debug!(table = %self.table, error = %err, "error while closing sqlite storage");
    }
    info!(table = %self.table, "sqlite storage closed");
  }
}
