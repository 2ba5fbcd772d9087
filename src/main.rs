use anyhow::{Context, Result};
use brokergate::api::{create_app, AppState};
use brokergate::approval::{
    run_registry_sweep, ApprovalBackend, ApprovalRegistry, AuditLog, ChannelBackend, DisabledBackend,
    NoOpBackend, WebhookChannel,
};
use brokergate::broker::{
    run_refresh_loop, run_state_cleanup, BrokerAuthFlow, BrokerProvider, CredentialPolicy, HttpTokenClient,
    StateManager,
};
use brokergate::config::{load_config, ApprovalMode, GateConfig, StorageBackend};
use brokergate::credentials::{FileTokenStore, SqliteTokenStore, TokenStore};
use brokergate::gate::{ActionCatalog, ExecutionGate, HttpBrokerageApi};
use brokergate::oauth::{open_records_db, run_sweep_loop, AuthorizationServer, OAuthStores};
use brokergate::rate_limit::RateLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATE_CLEANUP_INTERVAL_SECS: u64 = 60;
const APPROVAL_SWEEP_INTERVAL_SECS: u64 = 60;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "brokergate=info".into());

    let json = std::env::var("BROKERGATE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_token_store(config: &GateConfig) -> Result<Arc<dyn TokenStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Sqlite => {
            let key = config
                .storage
                .encryption_key
                .as_deref()
                .context("storage.encryption_key is required for the sqlite backend")?;
            Arc::new(
                SqliteTokenStore::new(&config.storage.sqlite_path, key)
                    .context("Failed to initialize credential store")?,
            )
        }
        StorageBackend::File => Arc::new(
            FileTokenStore::new(&config.storage.token_file)
                .context("Failed to initialize credential file")?,
        ),
    })
}

fn build_approval(
    config: &GateConfig,
    audit: Arc<AuditLog>,
) -> Result<(Arc<dyn ApprovalBackend>, Option<Arc<ApprovalRegistry>>)> {
    let approval = &config.approval;
    Ok(match approval.mode {
        ApprovalMode::Disabled => (Arc::new(DisabledBackend::new(audit)), None),
        ApprovalMode::Bypass => (Arc::new(NoOpBackend::new(audit)), None),
        ApprovalMode::Channel => {
            let webhook_url = approval
                .webhook_url
                .clone()
                .context("approval.webhook_url is required for approval.mode = \"channel\"")?;
            let registry = Arc::new(ApprovalRegistry::new(
                &approval.approvers,
                approval.max_pending,
                chrono::Duration::seconds(approval.retention_secs),
                audit,
            ));
            let channel = Arc::new(WebhookChannel::new(webhook_url, config.server.base_url.clone())?);
            (
                Arc::new(ChannelBackend::new(registry.clone(), channel)),
                Some(registry),
            )
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Brokergate starting...");

    let config_path =
        std::env::var("BROKERGATE_CONFIG").unwrap_or_else(|_| "brokergate.toml".to_string());
    let config = load_config(&config_path)?;
    config.validate().context("Invalid configuration")?;

    info!(
        bind_addr = %config.server.bind_addr,
        base_url = %config.server.base_url,
        storage = ?config.storage.backend,
        approval_mode = ?config.approval.mode,
        "Configuration loaded"
    );

    // Brokerage credential + handshake
    let token_store = build_token_store(&config)?;
    let provider = BrokerProvider::from_config(&config.broker);
    let token_client = Arc::new(HttpTokenClient::new(provider.clone())?);
    let max_age_secs = config
        .broker
        .max_credential_age_secs
        .context("broker.max_credential_age_secs must be set")?;
    let broker = Arc::new(BrokerAuthFlow::new(
        provider,
        StateManager::new(config.broker.state_ttl_secs, config.broker.max_pending_states),
        token_client,
        token_store,
        CredentialPolicy {
            max_age: chrono::Duration::seconds(max_age_secs),
            refresh_skew: chrono::Duration::seconds(config.broker.refresh_skew_secs),
        },
    ));
    info!("Brokerage auth flow initialized");

    // MCP-facing authorization server; clients and tokens survive restarts
    let records = open_records_db(&config.storage.sqlite_path)?;
    let oauth = Arc::new(AuthorizationServer::new(
        config.oauth.clone(),
        OAuthStores::durable(records, &config.oauth),
    ));
    info!("Authorization server initialized");

    let audit = Arc::new(AuditLog::default());
    let (approval, registry) = build_approval(&config, audit.clone())?;
    let approval_mode = approval.name();
    if config.approval.mode == ApprovalMode::Bypass {
        warn!("Human approval is BYPASSED for every mutating action");
    }

    let gate = Arc::new(ExecutionGate::new(
        oauth.clone(),
        broker.clone(),
        approval,
        Arc::new(HttpBrokerageApi::new(&config.broker.api_base_url)?),
        ActionCatalog::new(config.broker.actions.clone()),
        Duration::from_secs(config.approval.timeout_secs),
    ));

    // Background maintenance
    tokio::spawn(run_refresh_loop(broker.clone(), config.broker.refresh_interval_secs));
    tokio::spawn(run_state_cleanup(broker.states().clone(), STATE_CLEANUP_INTERVAL_SECS));
    tokio::spawn(run_sweep_loop(oauth.clone(), config.oauth.sweep_interval_secs));
    if let Some(registry) = &registry {
        tokio::spawn(run_registry_sweep(registry.clone(), APPROVAL_SWEEP_INTERVAL_SECS));
    }

    let rate_limiter = config.rate_limit.enabled.then(|| {
        Arc::new(RateLimiter::new(
            config.rate_limit.rules.clone(),
            config.rate_limit.max_clients,
        ))
    });
    if config.server.admin_token.is_none() {
        warn!("No admin token configured, /admin routes are closed");
    }

    let app = create_app(AppState {
        oauth,
        broker,
        gate,
        audit,
        registry,
        approval_mode,
        base_url: config.server.base_url.clone(),
        admin_token: config.server.admin_token.clone(),
        signing_secret: config.approval.signing_secret.clone(),
        rate_limiter,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Brokergate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
        }
        info!("Shutdown signal received");
    })
    .await
    .context("HTTP server error")?;

    info!("Brokergate stopped");
    Ok(())
}
