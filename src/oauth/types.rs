//! Records kept by the authorization server and the values it hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dynamically registered MCP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    /// SHA-256 of the issued secret, for `client_secret_post` clients
    pub client_secret_hash: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Client {
    pub fn is_confidential(&self) -> bool {
        self.client_secret_hash.is_some()
    }

    pub fn auth_method(&self) -> &'static str {
        if self.is_confidential() {
            "client_secret_post"
        } else {
            "none"
        }
    }
}

/// RFC 7591 registration request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMetadata {
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(default)]
    pub response_types: Option<Vec<String>>,
}

/// Registration result. `client_secret` is only ever available here.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client: Client,
    pub client_secret: Option<String>,
}

/// Query of GET /authorize
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationRequest {
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

/// An authorize request waiting for the operator's consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// Server-generated consent state, the lookup key
    pub state: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    /// The client's own `state`, echoed back on the final redirect
    pub client_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What the consent page shows
#[derive(Debug, Clone, PartialEq)]
pub struct ConsentView {
    pub state: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uri: String,
    pub scope: String,
    pub requires_password: bool,
}

/// Stored under the hash of the code value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

/// A code handed to the client through its redirect URI
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub client_id: String,
    /// `redirect_uri` with `code` and the client's `state` appended
    pub redirect_to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    pub client_id: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hash of the refresh token issued alongside
    pub refresh_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub client_id: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hash of the access token issued alongside
    pub access_hash: String,
}

/// Access + refresh pair returned by the token endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
}

/// Identity behind a live access token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    pub client_id: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

/// Client credentials presented at the token endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAuth<'a> {
    pub client_id: Option<&'a str>,
    pub client_secret: Option<&'a str>,
}

/// Record counts for the admin status page
#[derive(Debug, Clone, Default, Serialize)]
pub struct OAuthStats {
    pub clients: usize,
    pub pending: usize,
    pub codes: usize,
    pub access_tokens: usize,
    pub refresh_tokens: usize,
}
