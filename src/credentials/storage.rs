//! Encrypted single-row credential storage using SQLite.

use super::{BrokerageCredential, Cipher, StoreError, StoredCredential, TokenStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

/// Brokerage credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE brokerage_credential (
///     id INTEGER PRIMARY KEY CHECK (id = 1),  -- exactly one row
///     version INTEGER NOT NULL,               -- bumped on every write
///     access_token TEXT NOT NULL,             -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,                     -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     access_expires_at TEXT,                 -- RFC 3339
///     account TEXT,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
///
/// CREATE TABLE brokerage_credential_version (
///     id INTEGER PRIMARY KEY CHECK (id = 1),
///     last_version INTEGER NOT NULL           -- survives clear()
/// );
/// ```
///
/// Writes run in an IMMEDIATE transaction that re-reads the version before
/// updating, so the compare-and-swap also holds across processes sharing
/// the database file. Versions never repeat: a credential saved after
/// `clear` continues from the last version handed out.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    cipher: Cipher,
}

impl SqliteTokenStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (":memory:" for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = Cipher::from_base64(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS brokerage_credential (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                access_expires_at TEXT,
                account TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS brokerage_credential_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_version INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create credential tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn current_version(conn: &Connection) -> Result<Option<u64>> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM brokerage_credential WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read credential version")?;
        Ok(version.map(|v| v as u64))
    }

    /// Highest version ever written, including cleared credentials.
    fn last_version(conn: &Connection) -> Result<u64> {
        let last: Option<i64> = conn
            .query_row(
                "SELECT last_version FROM brokerage_credential_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read last credential version")?;
        Ok(last.unwrap_or(0) as u64)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .context("Failed to parse timestamp")?
        .with_timezone(&Utc))
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Result<Option<StoredCredential>, StoreError> {
        let conn = self.conn.lock().expect("credential db lock poisoned");

        type Row = (
            i64,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
        );

        let row: Option<Row> = conn
            .query_row(
                r#"
                SELECT version, access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       access_expires_at, account, created_at, updated_at
                FROM brokerage_credential
                WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query credential")?;

        let Some((version, at, at_nonce, rt, rt_nonce, expires_at, account, created_at, updated_at)) =
            row
        else {
            return Ok(None);
        };

        let access_token = self
            .cipher
            .open(&at, &at_nonce)
            .context("Failed to decrypt access token")?;

        let refresh_token = match (rt, rt_nonce) {
            (Some(encrypted), Some(nonce)) => Some(
                self.cipher
                    .open(&encrypted, &nonce)
                    .context("Failed to decrypt refresh token")?,
            ),
            _ => None,
        };

        let access_expires_at = expires_at.as_deref().map(parse_timestamp).transpose()?;

        Ok(Some(StoredCredential {
            credential: BrokerageCredential {
                access_token,
                refresh_token,
                access_expires_at,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                account,
            },
            version: version as u64,
        }))
    }

    fn save(
        &self,
        credential: &BrokerageCredential,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let (at, at_nonce) = self
            .cipher
            .seal(&credential.access_token)
            .context("Failed to encrypt access token")?;
        let (rt, rt_nonce) = self
            .cipher
            .seal_opt(credential.refresh_token.as_deref())
            .context("Failed to encrypt refresh token")?;
        let expires_at = credential.access_expires_at.map(|dt| dt.to_rfc3339());

        let mut conn = self.conn.lock().expect("credential db lock poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let found = Self::current_version(&tx)?;
        if found != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found,
            });
        }

        let next = Self::last_version(&tx)?.max(found.unwrap_or(0)) + 1;

        tx.execute(
            r#"
            INSERT INTO brokerage_credential (
                id, version,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                access_expires_at, account, created_at, updated_at
            )
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                access_token = excluded.access_token,
                access_token_nonce = excluded.access_token_nonce,
                refresh_token = excluded.refresh_token,
                refresh_token_nonce = excluded.refresh_token_nonce,
                access_expires_at = excluded.access_expires_at,
                account = excluded.account,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![
                next as i64,
                at,
                at_nonce,
                rt,
                rt_nonce,
                expires_at,
                credential.account,
                credential.created_at.to_rfc3339(),
                credential.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to store credential")?;

        tx.execute(
            r#"
            INSERT INTO brokerage_credential_version (id, last_version)
            VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET last_version = excluded.last_version
            "#,
            params![next as i64],
        )
        .context("Failed to record credential version")?;

        tx.commit().context("Failed to commit credential")?;

        Ok(next)
    }

    fn clear(&self) -> Result<bool, StoreError> {
        // last_version is left in place so the next save continues past it
        let rows = self
            .conn
            .lock()
            .expect("credential db lock poisoned")
            .execute("DELETE FROM brokerage_credential WHERE id = 1", [])
            .context("Failed to delete credential")?;
        Ok(rows > 0)
    }
}
