//! Action execution for MCP clients.
//!
//! - POST /api/actions `{"name": "...", "params": {...}}` runs one action
//! - GET  /api/actions lists the catalog
//!
//! Both require the bearer token issued by /token.

use crate::approval::ActionDescriptor;
use crate::auth::extract_bearer_token;
use crate::error::GateError;
use crate::gate::ExecutionGate;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ActionsAppState {
    pub gate: Arc<ExecutionGate>,
    pub base_url: String,
}

pub fn create_actions_router(state: ActionsAppState) -> Router {
    Router::new()
        .route("/api/actions", get(list_actions).post(execute_action))
        .with_state(Arc::new(state))
}

/// 401s point the client at the protected resource metadata (RFC 9728 §5.1).
fn reject(state: &ActionsAppState, err: GateError) -> Response {
    let unauthorized = matches!(err, GateError::InvalidToken);
    let mut response = err.into_response();
    if unauthorized {
        let challenge = format!(
            "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
            state.base_url.trim_end_matches('/')
        );
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

fn bearer(headers: &HeaderMap) -> Result<String, GateError> {
    extract_bearer_token(headers).map_err(|_| GateError::InvalidToken)
}

async fn list_actions(State(state): State<Arc<ActionsAppState>>, headers: HeaderMap) -> Response {
    let token = match bearer(&headers) {
        Ok(token) => token,
        Err(e) => return reject(&state, e),
    };
    match state.gate.authenticate(&token) {
        Ok(_) => Json(json!({ "actions": state.gate.catalog().routes() })).into_response(),
        Err(e) => reject(&state, e),
    }
}

async fn execute_action(
    State(state): State<Arc<ActionsAppState>>,
    headers: HeaderMap,
    body: Result<Json<ActionDescriptor>, JsonRejection>,
) -> Response {
    let token = match bearer(&headers) {
        Ok(token) => token,
        Err(e) => return reject(&state, e),
    };
    let action = match body {
        Ok(Json(action)) => action,
        Err(e) => return reject(&state, GateError::InvalidRequest(format!("action body: {}", e))),
    };

    // Dropping this handler (client disconnect) cancels a pending approval wait
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match state.gate.execute(&token, action, cancel).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => reject(&state, e),
    }
}
