// Shared fixtures for the HTTP integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use brokergate::api::{create_app, AppState};
use brokergate::approval::{
    ApprovalBackend, ApprovalChannel, ApprovalRegistry, ApprovalRequest, AuditLog, ChannelBackend,
    DisabledBackend, NoOpBackend,
};
use brokergate::broker::{BrokerAuthFlow, BrokerProvider, BrokerTokenClient, CredentialPolicy, StateManager, TokenGrant};
use brokergate::config::{ApprovalMode, OAuthConfig};
use brokergate::credentials::{BrokerageCredential, SqliteTokenStore, TokenStore};
use brokergate::gate::{
    default_action_catalog, ActionCatalog, BrokerageApi, BrokerageCall, BrokerageCallError,
    BrokerageResponse, ExecutionGate,
};
use brokergate::oauth::{s256_challenge, AuthorizationServer, OAuthStores};
use brokergate::rate_limit::{RateLimitRule, RateLimiter};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const REDIRECT: &str = "https://x/cb";
pub const ADMIN_TOKEN: &str = "admin-secret";
pub const SIGNING_SECRET: &str = "signing-secret";

pub struct StubTokenClient;

#[async_trait]
impl BrokerTokenClient for StubTokenClient {
    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> anyhow::Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: format!("at-for-{}", code),
            refresh_token: Some(format!("rt-for-{}", code)),
            expires_in: Some(1800),
            token_type: Some("Bearer".to_string()),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: "refreshed".to_string(),
            refresh_token: None,
            expires_in: Some(1800),
            token_type: None,
        })
    }
}

#[derive(Default)]
pub struct StubBrokerage {
    pub calls: Mutex<Vec<BrokerageCall>>,
}

impl StubBrokerage {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BrokerageApi for StubBrokerage {
    async fn call(
        &self,
        call: &BrokerageCall,
        _access_token: &str,
    ) -> Result<BrokerageResponse, BrokerageCallError> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(BrokerageResponse {
            status: 201,
            body: Value::Null,
            location: Some("https://broker.example/trader/v1/accounts/H/orders/991".to_string()),
        })
    }
}

#[derive(Default)]
pub struct QuietChannel {
    pub published: Mutex<Vec<ApprovalRequest>>,
}

#[async_trait]
impl ApprovalChannel for QuietChannel {
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        self.published.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn resolved(&self, _request: &ApprovalRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<SqliteTokenStore>,
    pub brokerage: Arc<StubBrokerage>,
    pub channel: Arc<QuietChannel>,
    pub registry: Arc<ApprovalRegistry>,
    pub audit: Arc<AuditLog>,
}

pub struct Options {
    pub mode: ApprovalMode,
    pub oauth: OAuthConfig,
    pub rate_limit: Option<Vec<RateLimitRule>>,
    pub approval_timeout: Duration,
    pub admin_token: Option<&'static str>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Channel,
            oauth: OAuthConfig::default(),
            rate_limit: None,
            approval_timeout: Duration::from_secs(600),
            admin_token: Some(ADMIN_TOKEN),
        }
    }
}

pub fn build(options: Options) -> TestApp {
    let oauth = Arc::new(AuthorizationServer::new(
        options.oauth.clone(),
        OAuthStores::memory(&options.oauth),
    ));

    let store = Arc::new(SqliteTokenStore::new(":memory:", &BASE64.encode([7u8; 32])).unwrap());
    let broker = Arc::new(BrokerAuthFlow::new(
        BrokerProvider {
            authorize_url: "https://broker.example/oauth/authorize".to_string(),
            token_url: "https://broker.example/oauth/token".to_string(),
            client_id: "app".to_string(),
            client_secret: "secret".to_string(),
            callback_url: "https://gate.example/admin/broker/callback".to_string(),
            scopes: vec![],
        },
        StateManager::new(600, 50),
        Arc::new(StubTokenClient),
        store.clone(),
        CredentialPolicy {
            max_age: chrono::Duration::days(7),
            refresh_skew: chrono::Duration::seconds(90),
        },
    ));

    let audit = Arc::new(AuditLog::default());
    let registry = Arc::new(ApprovalRegistry::new(
        ["alice"],
        10,
        chrono::Duration::hours(1),
        audit.clone(),
    ));
    let channel = Arc::new(QuietChannel::default());
    let (approval, exposed_registry): (Arc<dyn ApprovalBackend>, _) = match options.mode {
        ApprovalMode::Channel => (
            Arc::new(ChannelBackend::new(registry.clone(), channel.clone())),
            Some(registry.clone()),
        ),
        ApprovalMode::Bypass => (Arc::new(NoOpBackend::new(audit.clone())), None),
        ApprovalMode::Disabled => (Arc::new(DisabledBackend::new(audit.clone())), None),
    };
    let approval_mode = approval.name();

    let brokerage = Arc::new(StubBrokerage::default());
    let gate = Arc::new(ExecutionGate::new(
        oauth.clone(),
        broker.clone(),
        approval,
        brokerage.clone(),
        ActionCatalog::new(default_action_catalog()),
        options.approval_timeout,
    ));

    let router = create_app(AppState {
        oauth,
        broker,
        gate,
        audit: audit.clone(),
        registry: exposed_registry,
        approval_mode,
        base_url: "https://gate.example".to_string(),
        admin_token: options.admin_token.map(str::to_string),
        signing_secret: Some(SIGNING_SECRET.to_string()),
        rate_limiter: options
            .rate_limit
            .map(|rules| Arc::new(RateLimiter::new(rules, 100))),
    });

    TestApp {
        router,
        store,
        brokerage,
        channel,
        registry,
        audit,
    }
}

pub fn seed_credential(store: &SqliteTokenStore, age: chrono::Duration) {
    let now = Utc::now();
    let mut credential = BrokerageCredential::issued(
        "seed-access".to_string(),
        Some("seed-refresh".to_string()),
        Some(now + chrono::Duration::minutes(30)),
    );
    credential.created_at = now - age;
    store.save(&credential, None).unwrap();
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }

    pub fn location(&self) -> String {
        self.headers
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> Reply {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    Reply {
        status,
        headers,
        body,
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_form(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(fields).unwrap()))
        .unwrap()
}

pub fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );
    request
}

/// Value of query parameter `name` in `url`
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    params.into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

pub async fn register(router: &Router) -> String {
    let reply = send(
        router,
        post_json(
            "/register",
            &json!({"client_name": "Assistant", "redirect_uris": [REDIRECT]}),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.text());
    reply.json()["client_id"].as_str().unwrap().to_string()
}

/// GET /authorize, returning the consent state
pub async fn start_authorization(router: &Router, client_id: &str) -> String {
    let uri = format!(
        "/authorize?response_type=code&client_id={}&redirect_uri={}&state=client-state&code_challenge={}&code_challenge_method=S256",
        client_id,
        urlencoding::encode(REDIRECT),
        s256_challenge(VERIFIER),
    );
    let reply = send(router, get(&uri)).await;
    assert_eq!(reply.status, StatusCode::FOUND, "{}", reply.text());
    query_param(&reply.location(), "state").unwrap()
}

/// register → authorize → approve → token, returning the token response
pub async fn obtain_tokens(router: &Router) -> Value {
    let client_id = register(router).await;
    let state = start_authorization(router, &client_id).await;

    let reply = send(
        router,
        post_form("/consent", &[("state", &state), ("action", "approve")]),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FOUND);
    let code = query_param(&reply.location(), "code").unwrap();

    let reply = send(
        router,
        post_form(
            "/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("code_verifier", VERIFIER),
                ("client_id", &client_id),
                ("redirect_uri", REDIRECT),
            ],
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text());
    reply.json()
}
