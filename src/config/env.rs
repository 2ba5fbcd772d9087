use super::GateConfig;

/// Apply BROKERGATE_* environment variables on top of file config.
pub fn apply_env_overrides(cfg: &mut GateConfig) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides using an arbitrary lookup (env in production, a map in tests).
pub fn apply_overrides_from<F>(cfg: &mut GateConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = get("BROKERGATE_BIND_ADDR") {
        cfg.server.bind_addr = v;
    }
    if let Some(v) = get("BROKERGATE_BASE_URL") {
        cfg.server.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = get("BROKERGATE_ADMIN_TOKEN") {
        cfg.server.admin_token = Some(v);
    }
    if let Some(v) = get("BROKERGATE_ENCRYPTION_KEY") {
        cfg.storage.encryption_key = Some(v);
    }
    if let Some(v) = get("BROKERGATE_REGISTRATION_TOKEN") {
        cfg.oauth.registration_token = Some(v);
    }
    if let Some(v) = get("BROKERGATE_CONSENT_PASSWORD") {
        cfg.oauth.consent_password = Some(v);
    }
    if let Some(v) = get("BROKERGATE_BROKER_CLIENT_ID") {
        cfg.broker.client_id = v;
    }
    if let Some(v) = get("BROKERGATE_BROKER_CLIENT_SECRET") {
        cfg.broker.client_secret = v;
    }
    if let Some(v) = get("BROKERGATE_BROKER_CALLBACK_URL") {
        cfg.broker.callback_url = v;
    }
    if let Some(v) = get("BROKERGATE_MAX_CREDENTIAL_AGE_SECS") {
        if let Ok(n) = v.parse::<i64>() {
            cfg.broker.max_credential_age_secs = Some(n);
        }
    }
    if let Some(v) = get("BROKERGATE_APPROVAL_WEBHOOK_URL") {
        cfg.approval.webhook_url = Some(v);
    }
    if let Some(v) = get("BROKERGATE_APPROVAL_SIGNING_SECRET") {
        cfg.approval.signing_secret = Some(v);
    }
    if let Some(v) = get("BROKERGATE_APPROVERS") {
        cfg.approval.approvers = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = get("BROKERGATE_APPROVAL_TIMEOUT_SECS") {
        if let Ok(n) = v.parse::<u64>() {
            cfg.approval.timeout_secs = n;
        }
    }
    if let Some(v) = get("BROKERGATE_RATE_LIMIT_ENABLED") {
        if let Ok(b) = v.parse::<bool>() {
            cfg.rate_limit.enabled = b;
        }
    }
}
