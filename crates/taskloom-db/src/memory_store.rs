use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use taskloom_common::{Error, Result};
use tracing::{debug, info};

use crate::migrations::MEMORY_SCHEMA_V1;

/// One keyed memory value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Key/value memory used by the memory capabilities.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>>;

    /// Replace the value stored under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<MemoryEntry>;

    /// Append `value` on a new line to whatever is stored under `key`.
    async fn append(&self, key: &str, value: &str) -> Result<MemoryEntry>;

    async fn keys(&self) -> Result<Vec<String>>;
}

fn join_appended(existing: &str, value: &str) -> String {
    if existing.is_empty() {
        value.to_string()
    } else {
        format!("{existing}\n{value}")
    }
}

/// Memory persisted in a SQLite database.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening memory store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open memory database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        debug!("applying memory schema v{}", MEMORY_SCHEMA_V1.version);
        self.lock()
            .execute_batch(MEMORY_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("memory migration failed: {e}")))?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_entry(conn: &Connection, key: &str) -> Result<Option<MemoryEntry>> {
        let row = conn
            .query_row(
                "SELECT key, value, created_at, updated_at FROM memory_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read memory '{key}': {e}")))?;

        row.map(|(key, value, created_at, updated_at)| {
            Ok(MemoryEntry {
                key,
                value,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    fn upsert(conn: &Connection, key: &str, value: &str) -> Result<MemoryEntry> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO memory_entries (key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .map_err(|e| Error::Database(format!("failed to write memory '{key}': {e}")))?;

        Self::read_entry(conn, key)?
            .ok_or_else(|| Error::Database(format!("memory '{key}' vanished after write")))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("invalid timestamp '{raw}': {e}")))
}

#[async_trait]
impl MemoryProvider for SqliteMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let conn = self.lock();
        Self::read_entry(&conn, key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<MemoryEntry> {
        let conn = self.lock();
        Self::upsert(&conn, key, value)
    }

    async fn append(&self, key: &str, value: &str) -> Result<MemoryEntry> {
        let conn = self.lock();
        let existing = Self::read_entry(&conn, key)?
            .map(|e| e.value)
            .unwrap_or_default();
        Self::upsert(&conn, key, &join_appended(&existing, value))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM memory_entries ORDER BY key")
            .map_err(|e| Error::Database(format!("failed to list memory keys: {e}")))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to list memory keys: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read memory key: {e}")))?;
        Ok(keys)
    }
}

/// Process-local memory, for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, key: &str, value: String) -> MemoryEntry {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.value = value.clone();
                e.updated_at = now;
            })
            .or_insert_with(|| MemoryEntry {
                key: key.to_string(),
                value: value.clone(),
                created_at: now,
                updated_at: now,
            });
        entry.clone()
    }
}

#[async_trait]
impl MemoryProvider for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<MemoryEntry> {
        Ok(self.write(key, value.to_string()))
    }

    async fn append(&self, key: &str, value: &str) -> Result<MemoryEntry> {
        let existing = self.get(key).await?.map(|e| e.value).unwrap_or_default();
        Ok(self.write(key, join_appended(&existing, value)))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_creates_memory_entries_table() {
        let store = SqliteMemoryStore::in_memory().expect("failed to create in-memory store");
        let exists: i64 = store
            .lock()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='memory_entries'",
                [],
                |row| row.get(0),
            )
            .expect("failed to query sqlite_master");

        assert_eq!(exists, 1);
    }

    #[tokio::test]
    async fn set_then_get() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        assert!(store.get("user.name").await.unwrap().is_none());

        store.set("user.name", "Ada").await.unwrap();
        let entry = store.get("user.name").await.unwrap().unwrap();
        assert_eq!(entry.value, "Ada");

        store.set("user.name", "Grace").await.unwrap();
        let entry = store.get("user.name").await.unwrap().unwrap();
        assert_eq!(entry.value, "Grace");
        assert!(entry.updated_at >= entry.created_at);
    }

    #[tokio::test]
    async fn append_joins_with_newline() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        store.append("notes", "first").await.unwrap();
        let entry = store.append("notes", "second").await.unwrap();
        assert_eq!(entry.value, "first\nsecond");
    }

    #[tokio::test]
    async fn keys_are_sorted() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        store.set("b", "2").await.unwrap();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.set("project", "taskloom").await.unwrap();
        }
        let store = SqliteMemoryStore::open(&path).unwrap();
        let entry = store.get("project").await.unwrap().unwrap();
        assert_eq!(entry.value, "taskloom");
    }

    #[tokio::test]
    async fn in_process_store_matches_sqlite_semantics() {
        let store = InMemoryStore::new();
        store.append("log", "one").await.unwrap();
        store.append("log", "two").await.unwrap();
        assert_eq!(store.get("log").await.unwrap().unwrap().value, "one\ntwo");
        store.set("log", "reset").await.unwrap();
        assert_eq!(store.get("log").await.unwrap().unwrap().value, "reset");
        assert_eq!(store.keys().await.unwrap(), vec!["log"]);
    }
}
