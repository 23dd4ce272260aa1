//! SQLite-backed key-value store
//!
//! A single connection guarded by a mutex, driven from `spawn_blocking` so
//! callers on the async runtime never block on disk I/O. Contended writes
//! retry on `SQLITE_BUSY` with exponential backoff.

use crate::kv::KeyValueStore;
use crate::migrations::run_migrations;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for SQLITE_BUSY
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds
pub const BASE_BACKOFF_MS: u64 = 50;

/// Maximum backoff duration in milliseconds
pub const MAX_BACKOFF_MS: u64 = 1000;

/// Durable key-value store on a SQLite file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the store at `path` and bring its schema up to date
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Opening key-value store at {}", path.display());

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_millis(BASE_BACKOFF_MS))?;
        Self::from_connection(conn)
    }

    /// Open a transient store (tests, ephemeral wallets)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            with_busy_retry(|| f(&mut guard))
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_string();
        self.run(move |conn| {
            upsert(conn, &key, &value)?;
            Ok(())
        })
        .await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let keys = keys.to_vec();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?1")?;
            let mut values = Vec::with_capacity(keys.len());
            for key in &keys {
                values.push(
                    stmt.query_row(params![key], |row| row.get(0))
                        .optional()?,
                );
            }
            Ok(values)
        })
        .await
    }

    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (key, value) in &entries {
                upsert(&tx, key, value)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.run(move |conn| {
            let mut first_error = None;
            for key in &keys {
                if let Err(e) = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key]) {
                    tracing::warn!(key = %key, error = %e, "Failed to remove key");
                    first_error.get_or_insert(Error::from(e));
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .await
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let updated_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, updated_at],
    )?;
    Ok(())
}

/// Run `f`, retrying on SQLITE_BUSY
fn with_busy_retry<F, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(Error::Database(ref e)) if is_busy_error(e) && attempts < MAX_BUSY_RETRIES => {
                attempts += 1;
                let backoff = calculate_backoff(attempts);
                tracing::debug!(
                    "SQLITE_BUSY (attempt {}/{}), retrying in {}ms",
                    attempts,
                    MAX_BUSY_RETRIES,
                    backoff
                );
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if error is SQLITE_BUSY
fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::DatabaseBusy,
                ..
            },
            _
        )
    )
}

/// Calculate exponential backoff with jitter
fn calculate_backoff(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * (1 << attempt.min(6));
    let jitter = rand::random::<u64>() % (base / 4 + 1);
    (base + jitter).min(MAX_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("a", "1".to_string()).await.unwrap();
        store.set("a", "2".to_string()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        // Removing an absent key is a no-op
        store.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .multi_set(vec![
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string()),
            ])
            .await
            .unwrap();

        let keys = vec!["k1".to_string(), "nope".to_string(), "k2".to_string()];
        let values = store.multi_get(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some("v1".to_string()), None, Some("v2".to_string())]
        );

        store.multi_remove(&keys).await.unwrap();
        assert!(store
            .multi_get(&keys)
            .await
            .unwrap()
            .iter()
            .all(Option::is_none));
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("persisted", "yes".to_string()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("persisted").await.unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn test_calculate_backoff() {
        let b1 = calculate_backoff(1);
        let b2 = calculate_backoff(2);
        let b3 = calculate_backoff(3);

        assert!(b1 < b2 || b2 < b3);
        assert!(calculate_backoff(10) <= MAX_BACKOFF_MS);
    }

    #[test]
    fn test_busy_retry_gives_up() {
        let mut calls = 0;
        let result: Result<()> = with_busy_retry(|| {
            calls += 1;
            Err(Error::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            )))
        });

        assert!(result.is_err());
        assert_eq!(calls, MAX_BUSY_RETRIES + 1);
    }
}
