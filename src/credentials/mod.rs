//! Durable storage for the single upstream brokerage credential.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (trait)                 │
//! │  - load / save(expected_version) / age   │
//! │  - compare-and-swap on version           │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//! ┌───────────────────┐  ┌───────────────────┐
//! │ SqliteTokenStore  │  │  FileTokenStore   │
//! │ - single row      │  │ - JSON, mode 0600 │
//! │ - AES-256-GCM     │  │ - temp + rename   │
//! └───────────────────┘  └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use brokergate::credentials::{BrokerageCredential, SqliteTokenStore, TokenStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("BROKERGATE_ENCRYPTION_KEY")?;
//! let store = SqliteTokenStore::new("brokergate.db", &key)?;
//!
//! let credential = BrokerageCredential::issued(
//!     "access".to_string(),
//!     Some("refresh".to_string()),
//!     Some(Utc::now() + Duration::minutes(30)),
//! );
//!
//! // First write: nothing may exist yet
//! let version = store.save(&credential, None)?;
//!
//! // Later writes must name the version they replace
//! store.save(&credential, Some(version))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Single writer
//!
//! Every `save` names the version it expects to replace. A writer that lost a
//! race gets [`StoreError::VersionConflict`] and must reload before retrying.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod file;
mod storage;

pub use encryption::Cipher;
pub use file::FileTokenStore;
pub use storage::SqliteTokenStore;

/// The brokerage's OAuth token pair.
///
/// `created_at` marks when the refresh token was obtained through a full
/// authorization. Access-token refreshes keep it unchanged, so the
/// credential's age tracks the refresh token's age.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerageCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Account identity reported by the brokerage, if known
    #[serde(default)]
    pub account: Option<String>,
}

impl BrokerageCredential {
    /// A credential fresh from an authorization-code exchange.
    pub fn issued(
        access_token: String,
        refresh_token: Option<String>,
        access_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            access_token,
            refresh_token,
            access_expires_at,
            created_at: now,
            updated_at: now,
            account: None,
        }
    }

    /// Age of the refresh token at `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// True if the access token expires within `skew` of `now`.
    ///
    /// Credentials without a known expiry are treated as not expiring.
    pub fn access_expires_within(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        match self.access_expires_at {
            Some(expires_at) => expires_at - now <= skew,
            None => false,
        }
    }
}

/// A credential together with the version it was stored under.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredCredential {
    pub credential: BrokerageCredential,
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential version conflict (expected {expected:?}, found {found:?})")]
    VersionConflict {
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable home of the one brokerage credential per deployment.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredCredential>, StoreError>;

    /// Atomically replace the credential if the stored version still equals
    /// `expected_version` (`None` meaning no credential may exist yet).
    /// Returns the new version.
    fn save(
        &self,
        credential: &BrokerageCredential,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Remove the credential. Returns true if one existed.
    fn clear(&self) -> Result<bool, StoreError>;

    /// Age of the stored credential, None if nothing is stored.
    fn age(&self) -> Result<Option<Duration>, StoreError> {
        let now = Utc::now();
        Ok(self.load()?.map(|stored| stored.credential.age_at(now)))
    }
}
