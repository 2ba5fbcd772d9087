pub mod env;
pub use env::{apply_env_overrides, apply_overrides_from};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

// Re-export config types owned by their modules
pub use crate::gate::{default_action_catalog, ActionRoute};
pub use crate::rate_limit::{default_rate_limit_rules, RateLimitRule};

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public URL used as OAuth issuer and for building redirect targets
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for /admin routes. None disables the admin routes.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_url: default_base_url(),
            admin_token: None,
        }
    }
}

/// MCP-facing authorization server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: i64,
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: i64,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: i64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_max_entries")]
    pub max_pending: usize,
    #[serde(default = "default_max_entries")]
    pub max_codes: usize,
    #[serde(default = "default_max_entries")]
    pub max_access_tokens: usize,
    #[serde(default = "default_max_entries")]
    pub max_refresh_tokens: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Initial access token required on /register when set
    #[serde(default)]
    pub registration_token: Option<String>,
    /// Password the operator must type on the consent page when set
    #[serde(default)]
    pub consent_password: Option<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_pending_ttl() -> i64 {
    600
}

fn default_code_ttl() -> i64 {
    60
}

fn default_access_ttl() -> i64 {
    3600
}

fn default_refresh_ttl() -> i64 {
    30 * 24 * 3600
}

fn default_max_clients() -> usize {
    10
}

fn default_max_entries() -> usize {
    50
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_scopes() -> Vec<String> {
    vec!["mcp".to_string()]
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl(),
            code_ttl_secs: default_code_ttl(),
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            max_clients: default_max_clients(),
            max_pending: default_max_entries(),
            max_codes: default_max_entries(),
            max_access_tokens: default_max_entries(),
            max_refresh_tokens: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
            registration_token: None,
            consent_password: None,
            scopes: default_scopes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
}

/// Durable storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Brokerage credential file (file backend only)
    #[serde(default = "default_token_file")]
    pub token_file: String,
    /// Base64-encoded 32-byte key. Normally supplied via BROKERGATE_ENCRYPTION_KEY.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_sqlite_path() -> String {
    "brokergate.db".to_string()
}

fn default_token_file() -> String {
    "brokerage_token.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: default_sqlite_path(),
            token_file: default_token_file(),
            encryption_key: None,
        }
    }
}

/// Brokerage OAuth client and API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub authorize_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Maximum refresh-token age before the credential is stale. Required,
    /// it depends on the brokerage.
    #[serde(default)]
    pub max_credential_age_secs: Option<i64>,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_pending_ttl")]
    pub state_ttl_secs: i64,
    #[serde(default = "default_max_entries")]
    pub max_pending_states: usize,
    #[serde(default = "default_action_catalog")]
    pub actions: Vec<ActionRoute>,
}

fn default_refresh_skew() -> i64 {
    90
}

fn default_refresh_interval() -> u64 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            authorize_url: String::new(),
            token_url: String::new(),
            api_base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            callback_url: String::new(),
            scopes: Vec::new(),
            max_credential_age_secs: None,
            refresh_skew_secs: default_refresh_skew(),
            refresh_interval_secs: default_refresh_interval(),
            state_ttl_secs: default_pending_ttl(),
            max_pending_states: default_max_entries(),
            actions: default_action_catalog(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Mutating actions are refused outright
    #[default]
    Disabled,
    /// Human approval through the external channel
    Channel,
    /// Every mutating action is approved without a human (audited)
    Bypass,
}

/// Human approval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub mode: ApprovalMode,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// HMAC key for inbound decision callbacks
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_max_pending_approvals")]
    pub max_pending: usize,
    #[serde(default = "default_retention")]
    pub retention_secs: i64,
}

fn default_approval_timeout() -> u64 {
    600
}

fn default_max_pending_approvals() -> usize {
    100
}

fn default_retention() -> i64 {
    3600
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::default(),
            approvers: Vec::new(),
            timeout_secs: default_approval_timeout(),
            webhook_url: None,
            signing_secret: None,
            max_pending: default_max_pending_approvals(),
            retention_secs: default_retention(),
        }
    }
}

/// Per-IP rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_rate_limit_rules")]
    pub rules: Vec<RateLimitRule>,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_rate_limit_max_clients() -> usize {
    1000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            max_clients: default_rate_limit_max_clients(),
            rules: default_rate_limit_rules(),
        }
    }
}

impl GateConfig {
    /// Check cross-field requirements that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        match self.broker.max_credential_age_secs {
            Some(secs) if secs > 0 => {}
            Some(secs) => bail!("broker.max_credential_age_secs must be positive, got {}", secs),
            None => bail!("broker.max_credential_age_secs must be set"),
        }

        for (name, value) in [
            ("broker.authorize_url", &self.broker.authorize_url),
            ("broker.token_url", &self.broker.token_url),
            ("broker.api_base_url", &self.broker.api_base_url),
            ("broker.client_id", &self.broker.client_id),
            ("broker.client_secret", &self.broker.client_secret),
            ("broker.callback_url", &self.broker.callback_url),
        ] {
            if value.is_empty() {
                bail!("{} must be set", name);
            }
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.encryption_key.is_none() {
            bail!("storage.encryption_key (or BROKERGATE_ENCRYPTION_KEY) is required for the sqlite backend");
        }

        if self.approval.mode == ApprovalMode::Channel {
            if self.approval.approvers.is_empty() {
                bail!("approval.mode = \"channel\" requires at least one approver");
            }
            if self.approval.signing_secret.is_none() {
                bail!("approval.mode = \"channel\" requires approval.signing_secret");
            }
        }

        Ok(())
    }
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist. Environment overrides are applied afterwards.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GateConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        GateConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> GateConfig {
        let toml = r#"
            [storage]
            encryption_key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

            [broker]
            authorize_url = "https://broker.example/oauth/authorize"
            token_url = "https://broker.example/oauth/token"
            api_base_url = "https://broker.example"
            client_id = "app"
            client_secret = "secret"
            callback_url = "https://gate.example/admin/broker/callback"
            max_credential_age_secs = 432000
        "#;
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = GateConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.oauth.code_ttl_secs, 60);
        assert_eq!(config.oauth.max_clients, 10);
        assert_eq!(config.oauth.max_refresh_tokens, 50);
        assert_eq!(config.approval.mode, ApprovalMode::Disabled);
        assert_eq!(config.approval.timeout_secs, 600);
        assert_eq!(config.broker.max_credential_age_secs, None);
        assert!(config.rate_limit.enabled);
        assert!(!config.broker.actions.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:9000"
            base_url = "https://gate.example"

            [oauth]
            code_ttl_secs = 30
            max_clients = 3

            [storage]
            backend = "file"
            token_file = "/var/lib/gate/token.json"

            [approval]
            mode = "channel"
            approvers = ["1234", "5678"]
            timeout_secs = 120

            [[rate_limit.rules]]
            prefix = "/token"
            per_minute = 5
        "#;

        let config: GateConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.base_url, "https://gate.example");
        assert_eq!(config.oauth.code_ttl_secs, 30);
        assert_eq!(config.oauth.max_clients, 3);
        assert_eq!(config.oauth.access_ttl_secs, 3600); // Default
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.approval.mode, ApprovalMode::Channel);
        assert_eq!(config.approval.approvers, vec!["1234", "5678"]);
        assert_eq!(config.rate_limit.rules.len(), 1);
        assert_eq!(config.rate_limit.rules[0].per_minute, 5);
    }

    #[test]
    fn test_validate_requires_max_age() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.broker.max_credential_age_secs = None;
        assert!(config.validate().is_err());

        config.broker.max_credential_age_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_channel_mode_requirements() {
        let mut config = valid_config();
        config.approval.mode = ApprovalMode::Channel;
        assert!(config.validate().is_err());

        config.approval.approvers = vec!["1234".to_string()];
        assert!(config.validate().is_err());

        config.approval.signing_secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.oauth.pending_ttl_secs, 600);
    }
}
