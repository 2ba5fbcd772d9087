use super::pages::{message_page, with_page_headers, PageError};
use crate::approval::{ApprovalRegistry, AuditLog};
use crate::auth::bearer_matches;
use crate::broker::BrokerAuthFlow;
use crate::error::{GateError, GateResult};
use crate::oauth::AuthorizationServer;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// State for the operator API.
#[derive(Clone)]
pub struct AdminAppState {
    pub broker: Arc<BrokerAuthFlow>,
    pub oauth: Arc<AuthorizationServer>,
    pub audit: Arc<AuditLog>,
    /// Present when approvals go through the external channel
    pub registry: Option<Arc<ApprovalRegistry>>,
    pub approval_mode: &'static str,
    /// Required bearer token for /admin routes. None = routes closed.
    pub admin_token: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

const RECENT_AUDIT_EVENTS: usize = 20;

pub fn create_admin_router(state: AdminAppState) -> Router {
    let state = Arc::new(state);

    // The callback is protected by the single-use state, not the admin token:
    // it is reached by a browser redirect from the brokerage.
    let callback = with_page_headers(
        Router::new()
            .route("/admin/broker/callback", get(broker_callback))
            .with_state(state.clone()),
    );

    Router::new()
        .route("/admin/broker/authorize", post(broker_authorize))
        .route("/admin/broker/credential", delete(clear_credential))
        .route("/admin/status", get(status))
        .with_state(state)
        .merge(callback)
}

fn require_admin(headers: &HeaderMap, state: &AdminAppState) -> GateResult<()> {
    if bearer_matches(headers, state.admin_token.as_deref()) {
        Ok(())
    } else {
        warn!("Admin request without a valid admin token");
        Err(GateError::InvalidToken)
    }
}

/// POST /admin/broker/authorize: start the brokerage handshake.
async fn broker_authorize(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> GateResult<Json<serde_json::Value>> {
    require_admin(&headers, &state)?;
    let url = state.broker.begin("admin");
    Ok(Json(json!({ "authorization_url": url })))
}

/// GET /admin/broker/callback: the brokerage redirects here with code + state.
async fn broker_callback(
    State(state): State<Arc<AdminAppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, PageError> {
    if let Some(error) = query.error {
        warn!(error = %error, "Brokerage reported an authorization error");
        return Ok((
            StatusCode::BAD_REQUEST,
            Html(message_page(
                "Authorization failed",
                "The brokerage did not grant access. Start again from the admin API.",
            )),
        )
            .into_response());
    }

    let (Some(code), Some(csrf_state)) = (query.code, query.state) else {
        return Err(GateError::InvalidRequest("callback without code or state".to_string()).into());
    };

    let credential = state.broker.complete(&csrf_state, &code).await?;

    info!(
        has_refresh_token = credential.refresh_token.is_some(),
        "Brokerage connected through callback"
    );

    Ok(Html(message_page(
        "Brokerage connected",
        "The brokerage credential was stored. You can close this window.",
    ))
    .into_response())
}

/// DELETE /admin/broker/credential
async fn clear_credential(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> GateResult<Json<serde_json::Value>> {
    require_admin(&headers, &state)?;
    let removed = state.broker.clear()?;
    Ok(Json(json!({ "removed": removed })))
}

/// GET /admin/status
async fn status(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> GateResult<Json<serde_json::Value>> {
    require_admin(&headers, &state)?;

    let credential = state.broker.status()?;
    let oauth = state.oauth.stats()?;
    let pending = state
        .registry
        .as_ref()
        .map(|registry| registry.pending())
        .unwrap_or_default();

    Ok(Json(json!({
        "credential": credential,
        "oauth": oauth,
        "approval": {
            "mode": state.approval_mode,
            "pending": pending,
            "bypassed": state.audit.count("approval.bypassed"),
            "recent": state.audit.recent(RECENT_AUDIT_EVENTS),
        },
    })))
}
