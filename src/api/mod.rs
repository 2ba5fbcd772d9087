// HTTP surface: OAuth server, consent pages, operator API, approval decisions, actions

pub mod actions;
pub mod admin;
pub mod approvals;
pub mod oauth;
pub mod pages;

pub use actions::{create_actions_router, ActionsAppState};
pub use admin::{create_admin_router, AdminAppState};
pub use approvals::{create_approval_router, sign, ApprovalAppState, SIGNATURE_HEADER};
pub use oauth::{create_oauth_router, OAuthAppState};

use crate::approval::{ApprovalRegistry, AuditLog};
use crate::broker::BrokerAuthFlow;
use crate::gate::ExecutionGate;
use crate::oauth::AuthorizationServer;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use axum::{middleware, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

/// Everything the routers need, built once in `main`
#[derive(Clone)]
pub struct AppState {
    pub oauth: Arc<AuthorizationServer>,
    pub broker: Arc<BrokerAuthFlow>,
    pub gate: Arc<ExecutionGate>,
    pub audit: Arc<AuditLog>,
    pub registry: Option<Arc<ApprovalRegistry>>,
    pub approval_mode: &'static str,
    pub base_url: String,
    pub admin_token: Option<String>,
    pub signing_secret: Option<String>,
    /// None disables rate limiting
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "brokergate" }))
}

/// Full application router
pub fn create_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .merge(create_oauth_router(OAuthAppState {
            server: state.oauth.clone(),
            base_url: state.base_url.clone(),
        }))
        .merge(create_admin_router(AdminAppState {
            broker: state.broker.clone(),
            oauth: state.oauth.clone(),
            audit: state.audit.clone(),
            registry: state.registry.clone(),
            approval_mode: state.approval_mode,
            admin_token: state.admin_token.clone(),
        }))
        .merge(create_approval_router(ApprovalAppState {
            registry: state.registry.clone(),
            signing_secret: state.signing_secret.clone(),
        }))
        .merge(create_actions_router(ActionsAppState {
            gate: state.gate.clone(),
            base_url: state.base_url.clone(),
        }));

    match state.rate_limiter {
        Some(limiter) => router.layer(middleware::from_fn_with_state(limiter, rate_limit_middleware)),
        None => router,
    }
}
