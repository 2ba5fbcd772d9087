//! SQLite-backed record store for records that must survive a restart.

use super::store::{Bounds, Overflow, RecordError, RecordStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Open (or create) the database holding OAuth records.
pub fn open_records_db<P: AsRef<Path>>(path: P) -> anyhow::Result<Arc<Mutex<Connection>>> {
    let conn = Connection::open(path).context("Failed to open OAuth record database")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS oauth_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            record_key TEXT NOT NULL,
            value TEXT NOT NULL,
            expires_at INTEGER,
            UNIQUE (namespace, record_key)
        )
        "#,
        [],
    )
    .context("Failed to create oauth_records table")?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// One namespace of the shared `oauth_records` table.
///
/// Values are stored as JSON. Keys are whatever the caller hands in, which
/// for tokens and secrets is always a hash, never the raw value.
pub struct SqliteRecordStore<V> {
    conn: Arc<Mutex<Connection>>,
    namespace: &'static str,
    bounds: Bounds,
    _value: PhantomData<fn() -> V>,
}

impl<V> SqliteRecordStore<V> {
    pub fn new(conn: Arc<Mutex<Connection>>, namespace: &'static str, bounds: Bounds) -> Self {
        Self {
            conn,
            namespace,
            bounds,
            _value: PhantomData,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_expired(expires_at: Option<i64>) -> bool {
    expires_at.is_some_and(|at| at <= now_millis())
}

fn decode<V: DeserializeOwned>(value: &str) -> Result<V, RecordError> {
    Ok(serde_json::from_str(value).context("Failed to decode OAuth record")?)
}

impl<V> RecordStore<V> for SqliteRecordStore<V>
where
    V: Serialize + DeserializeOwned,
{
    fn get(&self, key: &str) -> Result<Option<V>, RecordError> {
        let conn = self.conn.lock().expect("oauth db lock poisoned");

        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM oauth_records WHERE namespace = ?1 AND record_key = ?2",
                params![self.namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read OAuth record")?;

        match row {
            Some((_, expires_at)) if is_expired(expires_at) => {
                conn.execute(
                    "DELETE FROM oauth_records WHERE namespace = ?1 AND record_key = ?2",
                    params![self.namespace, key],
                )
                .context("Failed to purge expired OAuth record")?;
                Ok(None)
            }
            Some((value, _)) => decode(&value).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>) -> Result<(), RecordError> {
        let json = serde_json::to_string(&value).context("Failed to encode OAuth record")?;
        let expires_at = expires_at.map(|at| at.timestamp_millis());

        let mut conn = self.conn.lock().expect("oauth db lock poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM oauth_records WHERE namespace = ?1 AND record_key = ?2)",
                params![self.namespace, key],
                |row| row.get(0),
            )
            .context("Failed to check OAuth record")?;

        if !exists {
            let count = |tx: &rusqlite::Transaction<'_>| -> Result<usize, RecordError> {
                let n: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM oauth_records WHERE namespace = ?1",
                        params![self.namespace],
                        |row| row.get(0),
                    )
                    .context("Failed to count OAuth records")?;
                Ok(n as usize)
            };

            if count(&tx)? >= self.bounds.capacity {
                tx.execute(
                    "DELETE FROM oauth_records WHERE namespace = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![self.namespace, now_millis()],
                )
                .context("Failed to purge expired OAuth records")?;

                let over = (count(&tx)? + 1).saturating_sub(self.bounds.capacity);
                if over > 0 {
                    if self.bounds.overflow == Overflow::Reject {
                        return Err(RecordError::Full(self.bounds.capacity));
                    }
                    tx.execute(
                        r#"
                        DELETE FROM oauth_records WHERE id IN (
                            SELECT id FROM oauth_records WHERE namespace = ?1 ORDER BY id LIMIT ?2
                        )
                        "#,
                        params![self.namespace, over as i64],
                    )
                    .context("Failed to evict OAuth records")?;
                }
            }
        }

        tx.execute(
            r#"
            INSERT INTO oauth_records (namespace, record_key, value, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (namespace, record_key)
            DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
            params![self.namespace, key, json, expires_at],
        )
        .context("Failed to write OAuth record")?;

        tx.commit().context("Failed to commit OAuth record")?;
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<V>, RecordError> {
        let conn = self.conn.lock().expect("oauth db lock poisoned");

        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "DELETE FROM oauth_records WHERE namespace = ?1 AND record_key = ?2 RETURNING value, expires_at",
                params![self.namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to take OAuth record")?;

        match row {
            Some((value, expires_at)) if !is_expired(expires_at) => decode(&value).map(Some),
            _ => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, RecordError> {
        let conn = self.conn.lock().expect("oauth db lock poisoned");
        let removed = conn
            .execute(
                "DELETE FROM oauth_records WHERE namespace = ?1 AND record_key = ?2",
                params![self.namespace, key],
            )
            .context("Failed to delete OAuth record")?;
        Ok(removed > 0)
    }

    fn sweep(&self) -> Result<usize, RecordError> {
        let conn = self.conn.lock().expect("oauth db lock poisoned");
        let removed = conn
            .execute(
                "DELETE FROM oauth_records WHERE namespace = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![self.namespace, now_millis()],
            )
            .context("Failed to sweep OAuth records")?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize, RecordError> {
        let conn = self.conn.lock().expect("oauth db lock poisoned");
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM oauth_records WHERE namespace = ?1",
                params![self.namespace],
                |row| row.get(0),
            )
            .context("Failed to count OAuth records")?;
        Ok(n as usize)
    }
}
