//! Brokerage-side OAuth client.
//!
//! Drives the three-legged handshake that produces the upstream credential
//! and keeps that credential usable afterwards:
//! 1. Operator calls POST /admin/broker/authorize → `begin()` returns the brokerage URL
//! 2. Operator signs in at the brokerage
//! 3. Brokerage redirects to /admin/broker/callback?code&state → `complete()`
//! 4. Code is exchanged, credential saved with compare-and-swap
//! 5. `credential_for_use()` refreshes the access token near expiry and
//!    refuses credentials older than the configured maximum age

mod exchange;
mod provider;
mod state_manager;

#[cfg(test)]
mod tests;

pub use exchange::{BrokerTokenClient, HttpTokenClient, TokenGrant};
pub use provider::BrokerProvider;
pub use state_manager::{run_state_cleanup, BrokerAuthContext, StateManager};

use crate::credentials::{BrokerageCredential, StoreError, StoredCredential, TokenStore};
use crate::error::{GateError, GateResult};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long a credential may be used, and when its access token is refreshed.
#[derive(Clone, Copy, Debug)]
pub struct CredentialPolicy {
    /// Maximum refresh-token age before the credential is stale
    pub max_age: Duration,
    /// Refresh the access token when it expires within this window
    pub refresh_skew: Duration,
}

/// Operator-facing snapshot of the stored credential
#[derive(Debug, Serialize)]
pub struct CredentialStatus {
    pub exists: bool,
    pub version: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub max_age_secs: i64,
    pub stale: bool,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub account: Option<String>,
    pub pending_states: usize,
}

pub struct BrokerAuthFlow {
    provider: BrokerProvider,
    states: StateManager,
    token_client: Arc<dyn BrokerTokenClient>,
    store: Arc<dyn TokenStore>,
    policy: CredentialPolicy,
    /// One refresh or completion write at a time within this process
    write_lock: Mutex<()>,
}

fn store_error(err: StoreError) -> GateError {
    match err {
        StoreError::VersionConflict { expected, found } => {
            warn!(?expected, ?found, "Brokerage credential version conflict");
            GateError::CredentialConflict
        }
        StoreError::Backend(e) => GateError::Internal(e.context("Token store failure")),
    }
}

impl BrokerAuthFlow {
    pub fn new(
        provider: BrokerProvider,
        states: StateManager,
        token_client: Arc<dyn BrokerTokenClient>,
        store: Arc<dyn TokenStore>,
        policy: CredentialPolicy,
    ) -> Self {
        Self {
            provider,
            states,
            token_client,
            store,
            policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    pub fn policy(&self) -> CredentialPolicy {
        self.policy
    }

    /// Start an authorization: remember a fresh CSRF state and return the
    /// brokerage authorize URL carrying it.
    pub fn begin(&self, initiated_by: &str) -> String {
        let redirect_uri = self.provider.callback_url.clone();
        let state = self.states.create_state(BrokerAuthContext {
            initiated_by: initiated_by.to_string(),
            redirect_uri: redirect_uri.clone(),
        });

        info!(initiated_by = %initiated_by, "Brokerage authorization started");

        self.provider.build_auth_url(&state, &redirect_uri)
    }

    /// Finish an authorization started by [`BrokerAuthFlow::begin`].
    ///
    /// `state` must match a pending entry exactly; on a miss nothing is
    /// exchanged. A failed exchange leaves the stored credential untouched.
    pub async fn complete(&self, state: &str, code: &str) -> GateResult<BrokerageCredential> {
        let entry = self.states.validate_and_consume(state).ok_or_else(|| {
            warn!("Brokerage callback with unknown or expired state");
            GateError::InvalidState
        })?;

        let observed = self.store.load().map_err(store_error)?;

        let grant = self
            .token_client
            .exchange_code(code, &entry.context.redirect_uri)
            .await
            .map_err(|e| {
                error!(error = %e, initiated_by = %entry.context.initiated_by, "Brokerage code exchange failed");
                GateError::ExchangeFailed("authorization code exchange".to_string())
            })?;

        let now = Utc::now();
        let mut credential = BrokerageCredential::issued(
            grant.access_token.clone(),
            grant.refresh_token.clone(),
            grant.expires_at(now),
        );
        credential.account = observed
            .as_ref()
            .and_then(|stored| stored.credential.account.clone());

        let _guard = self.write_lock.lock().await;
        let version = self.save_completed(&credential, observed.as_ref())?;

        info!(
            version,
            initiated_by = %entry.context.initiated_by,
            has_refresh_token = credential.refresh_token.is_some(),
            "Brokerage authorization completed"
        );

        Ok(credential)
    }

    /// Save a completed authorization against the version seen before the
    /// exchange. A refresh of that same authorization in the meantime is not
    /// a competing writer; another completed authorization is.
    fn save_completed(
        &self,
        credential: &BrokerageCredential,
        observed: Option<&StoredCredential>,
    ) -> GateResult<u64> {
        let expected = observed.map(|s| s.version);
        match self.store.save(credential, expected) {
            Ok(version) => Ok(version),
            Err(StoreError::VersionConflict { .. }) => {
                let current = self.store.load().map_err(store_error)?;
                match (observed, current) {
                    (Some(before), Some(now))
                        if now.credential.created_at == before.credential.created_at =>
                    {
                        debug!("Credential was refreshed during exchange, replacing it");
                        self.store
                            .save(credential, Some(now.version))
                            .map_err(store_error)
                    }
                    _ => {
                        warn!("Another authorization completed first, discarding this one");
                        Err(GateError::CredentialConflict)
                    }
                }
            }
            Err(e) => Err(store_error(e)),
        }
    }

    fn check_age(&self, credential: &BrokerageCredential, now: DateTime<Utc>) -> GateResult<()> {
        let age = credential.age_at(now);
        if age >= self.policy.max_age {
            warn!(
                age_secs = age.num_seconds(),
                max_age_secs = self.policy.max_age.num_seconds(),
                "Brokerage credential is stale, operator re-authorization required"
            );
            return Err(GateError::Stale {
                age_secs: age.num_seconds(),
            });
        }
        Ok(())
    }

    /// Fail fast if there is no usable credential, without refreshing.
    pub fn check_usable(&self) -> GateResult<()> {
        let stored = self
            .store
            .load()
            .map_err(store_error)?
            .ok_or(GateError::MissingCredential)?;
        self.check_age(&stored.credential, Utc::now())
    }

    /// Return a credential that is present, not stale and whose access token
    /// is not about to expire, refreshing it if needed.
    ///
    /// Concurrent callers that all see a near-expiry token share one refresh:
    /// the first takes the write lock, the rest re-read after it is released.
    pub async fn credential_for_use(&self) -> GateResult<BrokerageCredential> {
        let stored = self
            .store
            .load()
            .map_err(store_error)?
            .ok_or(GateError::MissingCredential)?;
        let now = Utc::now();
        self.check_age(&stored.credential, now)?;

        if !stored
            .credential
            .access_expires_within(self.policy.refresh_skew, now)
        {
            return Ok(stored.credential);
        }

        let _guard = self.write_lock.lock().await;

        let stored = self
            .store
            .load()
            .map_err(store_error)?
            .ok_or(GateError::MissingCredential)?;
        let now = Utc::now();
        self.check_age(&stored.credential, now)?;

        if !stored
            .credential
            .access_expires_within(self.policy.refresh_skew, now)
        {
            debug!("Access token already refreshed by another caller");
            return Ok(stored.credential);
        }

        self.refresh_locked(stored).await
    }

    /// Refresh after the brokerage rejected `rejected_access_token`, unless
    /// someone already replaced it.
    pub async fn force_refresh(&self, rejected_access_token: &str) -> GateResult<BrokerageCredential> {
        let _guard = self.write_lock.lock().await;

        let stored = self
            .store
            .load()
            .map_err(store_error)?
            .ok_or(GateError::MissingCredential)?;
        self.check_age(&stored.credential, Utc::now())?;

        if stored.credential.access_token != rejected_access_token {
            return Ok(stored.credential);
        }

        self.refresh_locked(stored).await
    }

    /// Caller must hold `write_lock`.
    async fn refresh_locked(&self, stored: StoredCredential) -> GateResult<BrokerageCredential> {
        let Some(refresh_token) = stored.credential.refresh_token.clone() else {
            warn!("Brokerage credential has no refresh token");
            return Err(GateError::ExchangeFailed("no refresh token".to_string()));
        };

        let grant = self.token_client.refresh(&refresh_token).await.map_err(|e| {
            error!(error = %e, "Brokerage token refresh failed");
            GateError::ExchangeFailed("refresh grant".to_string())
        })?;

        let now = Utc::now();
        let credential = BrokerageCredential {
            access_expires_at: grant.expires_at(now),
            access_token: grant.access_token,
            // Brokerages that do not rotate omit refresh_token; keep ours
            refresh_token: grant.refresh_token.or(Some(refresh_token)),
            created_at: stored.credential.created_at,
            updated_at: now,
            account: stored.credential.account.clone(),
        };

        let version = self
            .store
            .save(&credential, Some(stored.version))
            .map_err(store_error)?;

        info!(
            version,
            expires_at = ?credential.access_expires_at,
            "Brokerage access token refreshed"
        );

        Ok(credential)
    }

    /// Remove the stored credential (operator reset).
    pub fn clear(&self) -> GateResult<bool> {
        let removed = self.store.clear().map_err(store_error)?;
        if removed {
            warn!("Brokerage credential cleared by operator");
        }
        Ok(removed)
    }

    pub fn status(&self) -> GateResult<CredentialStatus> {
        let stored = self.store.load().map_err(store_error)?;
        let now = Utc::now();
        let max_age_secs = self.policy.max_age.num_seconds();
        let pending_states = self.states.count();

        Ok(match stored {
            Some(stored) => {
                let age = stored.credential.age_at(now);
                CredentialStatus {
                    exists: true,
                    version: Some(stored.version),
                    created_at: Some(stored.credential.created_at),
                    updated_at: Some(stored.credential.updated_at),
                    age_secs: Some(age.num_seconds()),
                    max_age_secs,
                    stale: age >= self.policy.max_age,
                    access_expires_at: stored.credential.access_expires_at,
                    account: stored.credential.account,
                    pending_states,
                }
            }
            None => CredentialStatus {
                exists: false,
                version: None,
                created_at: None,
                updated_at: None,
                age_secs: None,
                max_age_secs,
                stale: false,
                access_expires_at: None,
                account: None,
                pending_states,
            },
        })
    }

    /// One maintenance pass: refresh a near-expiry access token and warn when
    /// re-authorization is due within a day.
    pub async fn maintain(&self) {
        match self.status() {
            Ok(status) if !status.exists => {
                debug!("No brokerage credential stored, nothing to maintain");
                return;
            }
            Ok(status) => {
                if let Some(age) = status.age_secs {
                    let remaining = status.max_age_secs - age;
                    if remaining > 0 && remaining <= Duration::days(1).num_seconds() {
                        warn!(
                            remaining_secs = remaining,
                            "Brokerage credential expires soon, re-authorize"
                        );
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read brokerage credential status");
                return;
            }
        }

        if let Err(e) = self.credential_for_use().await {
            match e {
                GateError::Stale { .. } => {}
                other => warn!(error = %other, "Background credential maintenance failed"),
            }
        }
    }
}

/// Background task keeping the brokerage access token fresh
pub async fn run_refresh_loop(flow: Arc<BrokerAuthFlow>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        flow.maintain().await;
    }
}
