//! OAuth 2.1 authorization server facing MCP clients.
//!
//! Flow per client:
//! 1. POST /register → `register_client()`
//! 2. GET /authorize → `authorize()` parks a [`PendingAuthorization`] under a fresh state
//! 3. Operator approves on /consent → `approve_consent()` issues a single-use code
//! 4. POST /token (authorization_code) → `exchange_code()` checks PKCE, issues a token pair
//! 5. POST /token (refresh_token) → `refresh()` rotates both tokens
//!
//! Codes and tokens are only ever stored under their SHA-256 hash.

mod pkce;
mod sqlite;
mod store;
mod types;


pub use pkce::{is_valid_challenge, is_valid_verifier, s256_challenge, verify_s256};
pub use sqlite::{open_records_db, SqliteRecordStore};
pub use store::{Bounds, MemoryStore, Overflow, RecordError, RecordStore};
pub use types::{
    AccessTokenRecord, AuthorizationCode, AuthorizationRequest, Client, ClientAuth, ClientMetadata,
    ConsentView, IssuedCode, OAuthStats, PendingAuthorization, Principal, RefreshTokenRecord,
    RegisteredClient, TokenPair,
};

use crate::auth::{fingerprint, hash_secret, random_urlsafe, secrets_match};
use crate::config::OAuthConfig;
use crate::error::{GateError, GateResult};
use anyhow::anyhow;
use chrono::{Duration, Utc};
use reqwest::Url;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const ACCESS_TOKEN_PREFIX: &str = "bg_at_";
pub const REFRESH_TOKEN_PREFIX: &str = "bg_rt_";

impl From<RecordError> for GateError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Full(capacity) => {
                GateError::InvalidRequest(format!("store is full ({} entries)", capacity))
            }
            RecordError::Backend(e) => GateError::Internal(e.context("OAuth record store failure")),
        }
    }
}

/// The five stores behind an [`AuthorizationServer`]
pub struct OAuthStores {
    pub clients: Arc<dyn RecordStore<Client>>,
    pub pending: Arc<dyn RecordStore<PendingAuthorization>>,
    pub codes: Arc<dyn RecordStore<AuthorizationCode>>,
    pub access_tokens: Arc<dyn RecordStore<AccessTokenRecord>>,
    pub refresh_tokens: Arc<dyn RecordStore<RefreshTokenRecord>>,
}

impl OAuthStores {
    /// Everything in memory. Tokens do not survive a restart.
    pub fn memory(config: &OAuthConfig) -> Self {
        Self {
            clients: Arc::new(MemoryStore::new(Bounds::reject(config.max_clients))),
            pending: Arc::new(MemoryStore::new(Bounds::evict_oldest(config.max_pending))),
            codes: Arc::new(MemoryStore::new(Bounds::evict_oldest(config.max_codes))),
            access_tokens: Arc::new(MemoryStore::new(Bounds::evict_oldest(
                config.max_access_tokens,
            ))),
            refresh_tokens: Arc::new(MemoryStore::new(Bounds::evict_oldest(
                config.max_refresh_tokens,
            ))),
        }
    }

    /// Clients and tokens in SQLite, pending authorizations and codes in memory.
    pub fn durable(conn: Arc<Mutex<Connection>>, config: &OAuthConfig) -> Self {
        Self {
            clients: Arc::new(SqliteRecordStore::new(
                conn.clone(),
                "clients",
                Bounds::reject(config.max_clients),
            )),
            pending: Arc::new(MemoryStore::new(Bounds::evict_oldest(config.max_pending))),
            codes: Arc::new(MemoryStore::new(Bounds::evict_oldest(config.max_codes))),
            access_tokens: Arc::new(SqliteRecordStore::new(
                conn.clone(),
                "access_tokens",
                Bounds::evict_oldest(config.max_access_tokens),
            )),
            refresh_tokens: Arc::new(SqliteRecordStore::new(
                conn,
                "refresh_tokens",
                Bounds::evict_oldest(config.max_refresh_tokens),
            )),
        }
    }
}

pub struct AuthorizationServer {
    config: OAuthConfig,
    stores: OAuthStores,
}

fn validate_redirect_uri(uri: &str) -> GateResult<()> {
    let url = Url::parse(uri)
        .map_err(|_| GateError::InvalidRequest("redirect_uri must be an absolute URL".to_string()))?;

    if url.fragment().is_some() {
        return Err(GateError::InvalidRequest(
            "redirect_uri must not contain a fragment".to_string(),
        ));
    }

    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    match url.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        _ => Err(GateError::InvalidRequest(
            "redirect_uri must use https, or http on a loopback host".to_string(),
        )),
    }
}

fn redirect_with(redirect_uri: &str, params: &[(&str, &str)]) -> GateResult<String> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| GateError::Internal(anyhow!("Stored redirect_uri no longer parses: {}", e)))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}

impl AuthorizationServer {
    pub fn new(config: OAuthConfig, stores: OAuthStores) -> Self {
        Self { config, stores }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Gate for POST /register when a registration token is configured.
    pub fn check_registration_token(&self, presented: Option<&str>) -> GateResult<()> {
        match &self.config.registration_token {
            None => Ok(()),
            Some(expected) if presented.is_some_and(|p| secrets_match(p, expected)) => Ok(()),
            Some(_) => {
                warn!("Client registration attempted without a valid registration token");
                Err(GateError::InvalidToken)
            }
        }
    }

    pub fn register_client(&self, metadata: ClientMetadata) -> GateResult<RegisteredClient> {
        if metadata.redirect_uris.is_empty() {
            return Err(GateError::InvalidRequest(
                "at least one redirect_uri is required".to_string(),
            ));
        }
        for uri in &metadata.redirect_uris {
            validate_redirect_uri(uri)?;
        }

        if let Some(grant_types) = &metadata.grant_types {
            if grant_types
                .iter()
                .any(|g| g != "authorization_code" && g != "refresh_token")
            {
                return Err(GateError::InvalidRequest("unsupported grant_types".to_string()));
            }
        }
        if let Some(response_types) = &metadata.response_types {
            if response_types.iter().any(|r| r != "code") {
                return Err(GateError::InvalidRequest("unsupported response_types".to_string()));
            }
        }

        let client_secret = match metadata.token_endpoint_auth_method.as_deref() {
            None | Some("none") => None,
            Some("client_secret_post") => Some(random_urlsafe(32)),
            Some(other) => {
                return Err(GateError::InvalidRequest(format!(
                    "unsupported token_endpoint_auth_method {}",
                    other
                )))
            }
        };

        let client = Client {
            client_id: format!("bgc_{}", uuid::Uuid::new_v4().simple()),
            client_name: metadata.client_name.filter(|name| !name.trim().is_empty()),
            redirect_uris: metadata.redirect_uris,
            client_secret_hash: client_secret.as_deref().map(hash_secret),
            registered_at: Utc::now(),
        };

        self.stores
            .clients
            .put(&client.client_id, client.clone(), None)
            .map_err(|e| {
                if matches!(e, RecordError::Full(_)) {
                    warn!(max_clients = self.config.max_clients, "Client registry full, registration refused");
                }
                GateError::from(e)
            })?;

        info!(
            client_id = %client.client_id,
            client_name = ?client.client_name,
            auth_method = client.auth_method(),
            "OAuth client registered"
        );

        Ok(RegisteredClient {
            client,
            client_secret,
        })
    }

    pub fn get_client(&self, client_id: &str) -> GateResult<Option<Client>> {
        Ok(self.stores.clients.get(client_id)?)
    }

    fn resolve_scope(&self, requested: Option<&str>) -> GateResult<String> {
        let requested: Vec<&str> = requested
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default();

        if requested.is_empty() {
            return Ok(self.config.scopes.join(" "));
        }
        if let Some(unknown) = requested
            .iter()
            .find(|s| !self.config.scopes.iter().any(|known| known == *s))
        {
            return Err(GateError::InvalidRequest(format!("unsupported scope {}", unknown)));
        }
        Ok(requested.join(" "))
    }

    /// Validate an authorize request and park it until the operator decides.
    pub fn authorize(&self, request: AuthorizationRequest) -> GateResult<PendingAuthorization> {
        if request.response_type.as_deref() != Some("code") {
            return Err(GateError::InvalidRequest("response_type must be code".to_string()));
        }

        let client = self
            .stores
            .clients
            .get(&request.client_id)?
            .ok_or_else(|| GateError::InvalidClient(format!("unknown client {}", request.client_id)))?;

        let redirect_uri = match request.redirect_uri {
            Some(uri) if client.redirect_uris.contains(&uri) => uri,
            None if client.redirect_uris.len() == 1 => client.redirect_uris[0].clone(),
            _ => return Err(GateError::InvalidRedirect(client.client_id)),
        };

        if request.code_challenge_method.as_deref() != Some("S256") {
            return Err(GateError::InvalidRequest(
                "code_challenge_method must be S256".to_string(),
            ));
        }
        let code_challenge = request
            .code_challenge
            .filter(|c| is_valid_challenge(c))
            .ok_or_else(|| GateError::InvalidRequest("missing or malformed code_challenge".to_string()))?;

        let scope = self.resolve_scope(request.scope.as_deref())?;

        let pending = PendingAuthorization {
            state: random_urlsafe(32),
            client_id: client.client_id,
            redirect_uri,
            scope,
            code_challenge,
            client_state: request.state,
            created_at: Utc::now(),
        };

        let expires_at = pending.created_at + Duration::seconds(self.config.pending_ttl_secs);
        self.stores
            .pending
            .put(&pending.state, pending.clone(), Some(expires_at))?;

        debug!(client_id = %pending.client_id, "Authorization pending operator consent");

        Ok(pending)
    }

    /// Look up a pending authorization for the consent page.
    pub fn render_consent(&self, state: &str) -> GateResult<ConsentView> {
        let pending = self.stores.pending.get(state)?.ok_or(GateError::NotFound)?;
        let client_name = self
            .stores
            .clients
            .get(&pending.client_id)?
            .and_then(|client| client.client_name);

        Ok(ConsentView {
            state: pending.state,
            client_id: pending.client_id,
            client_name,
            redirect_uri: pending.redirect_uri,
            scope: pending.scope,
            requires_password: self.config.consent_password.is_some(),
        })
    }

    fn check_consent_password(&self, presented: Option<&str>) -> GateResult<()> {
        match &self.config.consent_password {
            None => Ok(()),
            Some(expected) if presented.is_some_and(|p| secrets_match(p, expected)) => Ok(()),
            Some(_) => {
                warn!("Consent approval with wrong or missing password");
                Err(GateError::PermissionDenied("consent password".to_string()))
            }
        }
    }

    /// Approve the pending authorization stored under exactly `state`.
    pub fn approve_consent(&self, state: &str, password: Option<&str>) -> GateResult<IssuedCode> {
        self.check_consent_password(password)?;

        let pending = self.stores.pending.take(state)?.ok_or_else(|| {
            warn!("Consent approval for unknown or expired state");
            GateError::InvalidState
        })?;

        let code = random_urlsafe(32);
        let record = AuthorizationCode {
            client_id: pending.client_id.clone(),
            redirect_uri: pending.redirect_uri.clone(),
            code_challenge: pending.code_challenge,
            scope: pending.scope,
            expires_at: Utc::now() + Duration::seconds(self.config.code_ttl_secs),
        };
        let expires_at = record.expires_at;
        self.stores
            .codes
            .put(&hash_secret(&code), record, Some(expires_at))?;

        let mut params = vec![("code", code.as_str())];
        if let Some(client_state) = pending.client_state.as_deref() {
            params.push(("state", client_state));
        }
        let redirect_to = redirect_with(&pending.redirect_uri, &params)?;

        info!(client_id = %pending.client_id, "Consent approved, authorization code issued");

        Ok(IssuedCode {
            code,
            client_id: pending.client_id,
            redirect_to,
        })
    }

    /// Deny the pending authorization stored under exactly `state`, returning
    /// the client redirect carrying `error=access_denied`.
    pub fn deny_consent(&self, state: &str) -> GateResult<String> {
        let pending = self.stores.pending.take(state)?.ok_or_else(|| {
            warn!("Consent denial for unknown or expired state");
            GateError::InvalidState
        })?;

        let mut params = vec![("error", "access_denied")];
        if let Some(client_state) = pending.client_state.as_deref() {
            params.push(("state", client_state));
        }

        info!(client_id = %pending.client_id, "Consent denied");

        redirect_with(&pending.redirect_uri, &params)
    }

    fn authenticate_client(&self, client_id: &str, auth: ClientAuth<'_>) -> GateResult<Client> {
        if auth.client_id.is_some_and(|presented| presented != client_id) {
            return Err(GateError::InvalidGrant(
                "grant was issued to another client".to_string(),
            ));
        }

        let client = self
            .stores
            .clients
            .get(client_id)?
            .ok_or_else(|| GateError::InvalidClient(format!("client {} no longer registered", client_id)))?;

        if let Some(expected_hash) = &client.client_secret_hash {
            let authenticated = auth
                .client_secret
                .is_some_and(|secret| secrets_match(&hash_secret(secret), expected_hash));
            if !authenticated {
                return Err(GateError::InvalidClient(format!(
                    "bad client_secret for {}",
                    client_id
                )));
            }
        }

        Ok(client)
    }

    fn issue_pair(&self, client_id: &str, scope: &str) -> GateResult<TokenPair> {
        let access_token = format!("{}{}", ACCESS_TOKEN_PREFIX, random_urlsafe(32));
        let refresh_token = format!("{}{}", REFRESH_TOKEN_PREFIX, random_urlsafe(32));
        let access_hash = hash_secret(&access_token);
        let refresh_hash = hash_secret(&refresh_token);

        let now = Utc::now();
        let access_expires = now + Duration::seconds(self.config.access_ttl_secs);
        let refresh_expires = now + Duration::seconds(self.config.refresh_ttl_secs);

        self.stores.refresh_tokens.put(
            &refresh_hash,
            RefreshTokenRecord {
                client_id: client_id.to_string(),
                scope: scope.to_string(),
                issued_at: now,
                expires_at: refresh_expires,
                access_hash: access_hash.clone(),
            },
            Some(refresh_expires),
        )?;
        let stored = self.stores.access_tokens.put(
            &access_hash,
            AccessTokenRecord {
                client_id: client_id.to_string(),
                scope: scope.to_string(),
                issued_at: now,
                expires_at: access_expires,
                refresh_hash: refresh_hash.clone(),
            },
            Some(access_expires),
        );
        if let Err(e) = stored {
            self.stores.refresh_tokens.delete(&refresh_hash)?;
            return Err(e.into());
        }

        info!(
            client_id = %client_id,
            access = %fingerprint(&access_token),
            "Issued token pair"
        );

        Ok(TokenPair {
            access_token,
            token_type: "Bearer",
            expires_in: self.config.access_ttl_secs,
            refresh_token,
            scope: scope.to_string(),
        })
    }

    /// Redeem an authorization code. The code is gone afterwards whether or
    /// not the exchange succeeds.
    pub fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: Option<&str>,
        auth: ClientAuth<'_>,
    ) -> GateResult<TokenPair> {
        let record = self
            .stores
            .codes
            .take(&hash_secret(code))?
            .ok_or_else(|| GateError::InvalidGrant("unknown, expired or used code".to_string()))?;

        if !verify_s256(code_verifier, &record.code_challenge) {
            warn!(client_id = %record.client_id, "PKCE verification failed");
            return Err(GateError::InvalidGrant("code_verifier mismatch".to_string()));
        }

        if redirect_uri.is_some_and(|uri| uri != record.redirect_uri) {
            return Err(GateError::InvalidGrant("redirect_uri mismatch".to_string()));
        }

        let client = self.authenticate_client(&record.client_id, auth)?;
        self.issue_pair(&client.client_id, &record.scope)
    }

    /// Rotate a refresh token: the old refresh token and its access token
    /// stop working, a new pair is issued.
    pub fn refresh(&self, refresh_token: &str, auth: ClientAuth<'_>) -> GateResult<TokenPair> {
        let refresh_hash = hash_secret(refresh_token);
        let record = self
            .stores
            .refresh_tokens
            .get(&refresh_hash)?
            .ok_or_else(|| GateError::InvalidGrant("unknown, expired or revoked refresh token".to_string()))?;

        let client = self.authenticate_client(&record.client_id, auth)?;

        // Only one of several concurrent rotations gets the record
        let record = self
            .stores
            .refresh_tokens
            .take(&refresh_hash)?
            .ok_or_else(|| GateError::InvalidGrant("refresh token already used".to_string()))?;

        debug!(client_id = %client.client_id, "Rotating refresh token");

        // Revoke the old access token only once its replacement is stored
        let pair = match self.issue_pair(&client.client_id, &record.scope) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    client_id = %client.client_id,
                    error = %e,
                    "Refresh rotation failed, restoring old refresh token"
                );
                let expires_at = record.expires_at;
                self.stores
                    .refresh_tokens
                    .put(&refresh_hash, record, Some(expires_at))?;
                return Err(e);
            }
        };
        self.stores.access_tokens.delete(&record.access_hash)?;

        Ok(pair)
    }

    /// Identity behind a live access token, or None.
    pub fn introspect(&self, access_token: &str) -> GateResult<Option<Principal>> {
        Ok(self
            .stores
            .access_tokens
            .get(&hash_secret(access_token))?
            .map(|record| Principal {
                client_id: record.client_id,
                scope: record.scope,
                expires_at: record.expires_at,
            }))
    }

    /// RFC 7009 revocation. Returns whether anything was revoked; unknown
    /// tokens are not an error.
    pub fn revoke(&self, token: &str) -> GateResult<bool> {
        let hash = hash_secret(token);

        if let Some(record) = self.stores.refresh_tokens.take(&hash)? {
            self.stores.access_tokens.delete(&record.access_hash)?;
            info!(client_id = %record.client_id, "Refresh token revoked");
            return Ok(true);
        }

        if let Some(record) = self.stores.access_tokens.take(&hash)? {
            info!(client_id = %record.client_id, "Access token revoked");
            return Ok(true);
        }

        debug!("Revocation of unknown token ignored");
        Ok(false)
    }

    /// Drop expired records from every store.
    pub fn sweep(&self) -> GateResult<usize> {
        let removed = self.stores.pending.sweep()?
            + self.stores.codes.sweep()?
            + self.stores.access_tokens.sweep()?
            + self.stores.refresh_tokens.sweep()?
            + self.stores.clients.sweep()?;
        Ok(removed)
    }

    pub fn stats(&self) -> GateResult<OAuthStats> {
        Ok(OAuthStats {
            clients: self.stores.clients.len()?,
            pending: self.stores.pending.len()?,
            codes: self.stores.codes.len()?,
            access_tokens: self.stores.access_tokens.len()?,
            refresh_tokens: self.stores.refresh_tokens.len()?,
        })
    }
}

/// Background task removing expired OAuth records
pub async fn run_sweep_loop(server: Arc<AuthorizationServer>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match server.sweep() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Swept expired OAuth records"),
            Err(e) => warn!(error = %e, "OAuth record sweep failed"),
        }
    }
}
