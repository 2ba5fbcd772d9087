//! Brokerage OAuth endpoint configuration.

use crate::config::BrokerConfig;

/// The brokerage as an OAuth provider
#[derive(Clone, Debug)]
pub struct BrokerProvider {
    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    pub client_id: String,

    pub client_secret: String,

    /// Where the brokerage sends the operator back to
    pub callback_url: String,

    pub scopes: Vec<String>,
}

impl BrokerProvider {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            callback_url: config.callback_url.clone(),
            scopes: config.scopes.clone(),
        }
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let separator = if self.authorize_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&state={}",
            self.authorize_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state)
        );
        if !self.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&self.scopes.join(" ")));
        }
        url
    }
}
