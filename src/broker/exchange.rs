//! Brokerage token endpoint client.
//!
//! Handles the authorization-code exchange and the refresh grant. The
//! brokerage authenticates the app with HTTP Basic client credentials.

use super::provider::BrokerProvider;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|seconds| now + Duration::seconds(seconds))
    }
}

/// Calls against the brokerage token endpoint
#[async_trait]
pub trait BrokerTokenClient: Send + Sync {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// reqwest-backed token client
pub struct HttpTokenClient {
    http: reqwest::Client,
    provider: BrokerProvider,
}

impl HttpTokenClient {
    pub fn new(provider: BrokerProvider) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, provider })
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .basic_auth(&self.provider.client_id, Some(&self.provider.client_secret))
            .form(form)
            .send()
            .await
            .context("Failed to send token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(anyhow!(
                "Token endpoint returned status {}: {}",
                status,
                body
            ));
        }

        let grant: TokenGrant = response
            .json()
            .await
            .context("Failed to parse token response")?;

        if grant.access_token.is_empty() {
            return Err(anyhow!("Token response contained an empty access_token"));
        }

        tracing::debug!(
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = ?grant.expires_in,
            "Token endpoint call successful"
        );

        Ok(grant)
    }
}

#[async_trait]
impl BrokerTokenClient for HttpTokenClient {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        tracing::debug!(token_url = %self.provider.token_url, "Exchanging authorization code");
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        tracing::debug!(token_url = %self.provider.token_url, "Refreshing brokerage access token");
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}
