//! Local key/value storage for taskboard
//!
//! Every piece of persisted state (tasks, users, settings, recycle bin,
//! presence heartbeats, backups) is a JSON document under its own key.
//! Writes to different keys are independent; nothing spans keys.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const TASKS_KEY: &str = "taskboard:v1:tasks";
pub const USERS_KEY: &str = "taskboard:v1:users";
pub const SETTINGS_KEY: &str = "taskboard:v1:settings";
pub const RECYCLE_BIN_KEY: &str = "taskboard:v1:recycle_bin";
pub const VERSION_KEY: &str = "taskboard:version";
pub const PRESENCE_PREFIX: &str = "taskboard:v1:presence:";
pub const BACKUP_PREFIX: &str = "taskboard:backup:";

/// Default quota, matching the usual browser local storage budget
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Storage failure taxonomy
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is full: writing {key} needs {needed} bytes but only {available} are free")]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("stored data under {key} is corrupted: {source}")]
    CorruptedData {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage is unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    QuotaExceeded,
    CorruptedData,
    Unavailable,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::QuotaExceeded { .. } => StorageErrorKind::QuotaExceeded,
            StorageError::CorruptedData { .. } => StorageErrorKind::CorruptedData,
            StorageError::Unavailable(_) => StorageErrorKind::Unavailable,
        }
    }

    /// Message suitable for a non-fatal warning shown to the user
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            StorageErrorKind::QuotaExceeded => {
                "Storage is full. Please clear some data; changes may not persist."
            }
            StorageErrorKind::CorruptedData => {
                "Stored data could not be read or saved. Please reload."
            }
            StorageErrorKind::Unavailable => "Storage is not available. Data may not be saved.",
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A persistence failure kept around so callers can warn the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageWarning {
    pub kind: StorageErrorKind,
    pub message: String,
    pub detail: String,
    pub at: String,
}

/// Most recent write failure, shared by everything that persists in the background
#[derive(Debug, Clone, Default)]
pub struct WarningSlot(Arc<Mutex<Option<StorageWarning>>>);

impl WarningSlot {
    pub fn record(&self, err: &StorageError) {
        tracing::warn!(kind = ?err.kind(), error = %err, "Storage write failed; changes may not persist");
        let warning = StorageWarning {
            kind: err.kind(),
            message: err.user_message().to_string(),
            detail: err.to_string(),
            at: Utc::now().to_rfc3339(),
        };
        *self.lock() = Some(warning);
    }

    pub fn peek(&self) -> Option<StorageWarning> {
        self.lock().clone()
    }

    pub fn take(&self) -> Option<StorageWarning> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<StorageWarning>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Usage against the configured quota
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageInfo {
    pub used: u64,
    pub available: u64,
    pub percentage: f64,
}

/// A key written by some session after a known revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageChange {
    pub key: String,
    pub writer: String,
    pub revision: i64,
    pub updated_at: String,
}

/// Thread-safe key/value store
pub struct Storage {
    conn: Mutex<Connection>,
    quota_bytes: u64,
    writer: String,
}

impl Storage {
    /// Open or create the store. `writer` tags every write made through this handle.
    pub fn open(path: &Path, quota_bytes: u64, writer: impl Into<String>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to create storage directory");
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn, quota_bytes, writer)
    }

    pub fn open_in_memory(quota_bytes: u64, writer: impl Into<String>) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, quota_bytes, writer)
    }

    fn with_connection(
        conn: Connection,
        quota_bytes: u64,
        writer: impl Into<String>,
    ) -> StorageResult<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
            quota_bytes,
            writer: writer.into(),
        };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                writer TEXT NOT NULL,
                revision INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Monotonic write counter, survives key removal
            CREATE TABLE IF NOT EXISTS meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO meta (name, value) VALUES ('revision', 0);

            CREATE INDEX IF NOT EXISTS idx_kv_revision ON kv(revision);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// Read and decode a JSON value; a missing key is `Ok(None)`
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::CorruptedData {
                key: key.to_string(),
                source,
            })
    }

    pub fn get_raw(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::CorruptedData {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, &raw)
    }

    /// Write a raw value, enforcing the quota
    pub fn set_raw(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let used_elsewhere: i64 = tx.query_row(
            "SELECT COALESCE(SUM(length(key) + length(value)), 0) FROM kv WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        let needed = (key.chars().count() + value.chars().count()) as u64;
        let available = self.quota_bytes.saturating_sub(used_elsewhere.max(0) as u64);
        if needed > available {
            return Err(StorageError::QuotaExceeded {
                key: key.to_string(),
                needed,
                available,
            });
        }

        tx.execute("UPDATE meta SET value = value + 1 WHERE name = 'revision'", [])?;
        let revision: i64 =
            tx.query_row("SELECT value FROM meta WHERE name = 'revision'", [], |row| {
                row.get(0)
            })?;

        tx.execute(
            r#"INSERT INTO kv (key, value, writer, revision, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, writer = excluded.writer,
                   revision = excluded.revision, updated_at = excluded.updated_at"#,
            params![key, value, &self.writer, revision, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Remove a key, returning whether it existed
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| {
            row.get(0)
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn clear(&self) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }

    pub fn info(&self) -> StorageResult<StorageInfo> {
        let conn = self.conn();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(key) + length(value)), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        let used = used.max(0) as u64;
        let percentage = if self.quota_bytes == 0 {
            100.0
        } else {
            used as f64 / self.quota_bytes as f64 * 100.0
        };

        Ok(StorageInfo {
            used,
            available: self.quota_bytes.saturating_sub(used),
            percentage,
        })
    }

    /// Latest write revision across all keys
    pub fn revision(&self) -> StorageResult<i64> {
        let conn = self.conn();
        let revision = conn.query_row("SELECT value FROM meta WHERE name = 'revision'", [], |row| {
            row.get(0)
        })?;
        Ok(revision)
    }

    /// Keys written after `revision` by any writer other than `exclude_writer`
    pub fn changes_since(
        &self,
        revision: i64,
        exclude_writer: &str,
    ) -> StorageResult<Vec<StorageChange>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, writer, revision, updated_at FROM kv
             WHERE revision > ?1 AND writer != ?2 ORDER BY revision",
        )?;
        let rows = stmt.query_map(params![revision, exclude_writer], |row| {
            Ok(StorageChange {
                key: row.get(0)?,
                writer: row.get(1)?,
                revision: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn is_available(&self) -> bool {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}
