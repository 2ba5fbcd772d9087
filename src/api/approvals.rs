//! Inbound approval decisions.
//!
//! POST /approvals/:id/decision with body `{"approver": "...", "verdict": "approve" | "deny"}`
//! and header `X-Brokergate-Signature: sha256=<hex>`, an HMAC-SHA256 over
//! the raw body keyed with `approval.signing_secret`. The signature proves
//! the message came through the channel integration; the approver is still
//! checked against the allow-list by the registry.

use crate::approval::{ApprovalRegistry, DecisionOutcome, IgnoreReason, Verdict};
use crate::auth::secrets_match;
use crate::error::{GateError, GateResult};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-brokergate-signature";

#[derive(Clone)]
pub struct ApprovalAppState {
    /// None when approval mode is not `channel`
    pub registry: Option<Arc<ApprovalRegistry>>,
    pub signing_secret: Option<String>,
}

#[derive(Deserialize)]
struct DecisionBody {
    approver: String,
    verdict: Verdict,
}

pub fn create_approval_router(state: ApprovalAppState) -> Router {
    Router::new()
        .route("/approvals/:id/decision", post(decide))
        .with_state(Arc::new(state))
}

/// `sha256=<hex>` for `body` under `secret`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("Invalid secret: {e}"))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Compute HMAC-SHA256 against raw body bytes (not re-serialized JSON)
fn validate_signature(headers: &HeaderMap, raw_body: &[u8], secret: Option<&str>) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "No signing secret configured".to_string())?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| format!("Missing signature header: {}", SIGNATURE_HEADER))?;

    if !signature.starts_with("sha256=") {
        return Err("Signature must be sha256=<hex>".to_string());
    }

    if secrets_match(signature, &sign(secret, raw_body)?) {
        Ok(())
    } else {
        Err("Signature mismatch".to_string())
    }
}

async fn decide(
    State(state): State<Arc<ApprovalAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> GateResult<Response> {
    let Some(registry) = &state.registry else {
        return Err(GateError::NotFound);
    };

    if let Err(reason) = validate_signature(&headers, &body, state.signing_secret.as_deref()) {
        warn!(approval_id = %id, reason = %reason, "Rejected unsigned approval decision");
        return Err(GateError::InvalidToken);
    }

    let id = Uuid::parse_str(&id).map_err(|_| GateError::NotFound)?;
    let decision: DecisionBody = serde_json::from_slice(&body)
        .map_err(|e| GateError::InvalidRequest(format!("decision body: {}", e)))?;

    let outcome = registry.decide(id, &decision.approver, decision.verdict);
    let status = match outcome {
        DecisionOutcome::Applied(_) => StatusCode::OK,
        DecisionOutcome::Ignored(IgnoreReason::NotAllowed) => StatusCode::FORBIDDEN,
        DecisionOutcome::Ignored(IgnoreReason::UnknownRequest) => StatusCode::NOT_FOUND,
        DecisionOutcome::Ignored(IgnoreReason::AlreadyResolved) => StatusCode::CONFLICT,
    };

    Ok((status, Json(outcome)).into_response())
}
