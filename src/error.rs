//! Error taxonomy shared by every gate component.
//!
//! Variants carry enough detail for the operator log. Callers only ever see
//! the fixed `error` code and description from [`GateError::public_parts`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Malformed input rejected at the boundary.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid client: {0}")]
    InvalidClient(String),

    #[error("redirect_uri not registered for client {0}")]
    InvalidRedirect(String),

    /// State value did not match a pending entry exactly.
    #[error("unknown or expired state")]
    InvalidState,

    /// Bad, expired, reused or revoked code / refresh token.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// Missing, unknown or expired bearer token.
    #[error("invalid bearer token")]
    InvalidToken,

    #[error("not found")]
    NotFound,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("approval deadline exceeded for {0}")]
    Timeout(String),

    #[error("approval wait cancelled for {0}")]
    Cancelled(String),

    /// An identical action already ran under the same approval.
    #[error("duplicate of an action already executed under its approval: {0}")]
    DuplicateAction(String),

    #[error("approval channel unavailable: {0}")]
    ApprovalUnavailable(String),

    /// Brokerage credential older than the configured maximum age.
    #[error("brokerage credential is stale (age {age_secs}s), re-authorization required")]
    Stale { age_secs: i64 },

    #[error("no brokerage credential stored, authorization required")]
    MissingCredential,

    #[error("brokerage credential changed concurrently")]
    CredentialConflict,

    #[error("brokerage token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("brokerage call failed: {0}")]
    Brokerage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GateError {
    /// OAuth-style error code, HTTP status and generic description.
    pub fn public_parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            GateError::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "The request is missing a required parameter or is malformed",
            ),
            GateError::InvalidClient(_) => (
                StatusCode::UNAUTHORIZED,
                "invalid_client",
                "Client authentication failed",
            ),
            GateError::InvalidRedirect(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "The redirect_uri is not registered for this client",
            ),
            GateError::InvalidState => (
                StatusCode::BAD_REQUEST,
                "invalid_state",
                "Unknown or expired state",
            ),
            GateError::InvalidGrant(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                "The grant is invalid, expired or already used",
            ),
            GateError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "The access token is missing, invalid or expired",
            ),
            GateError::NotFound => (StatusCode::NOT_FOUND, "not_found", "Not found"),
            GateError::PermissionDenied(_) => (
                StatusCode::FORBIDDEN,
                "permission_denied",
                "The action was not approved",
            ),
            GateError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "approval_timeout",
                "No approval decision was made before the deadline",
            ),
            GateError::Cancelled(_) => (
                StatusCode::CONFLICT,
                "cancelled",
                "The request was cancelled",
            ),
            GateError::DuplicateAction(_) => (
                StatusCode::CONFLICT,
                "duplicate_action",
                "An identical action was already executed under this approval",
            ),
            GateError::ApprovalUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "approval_unavailable",
                "Approval could not be requested",
            ),
            GateError::Stale { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "credential_stale",
                "Brokerage authorization has expired, an operator must re-authorize",
            ),
            GateError::MissingCredential => (
                StatusCode::SERVICE_UNAVAILABLE,
                "credential_missing",
                "Brokerage is not authorized, an operator must authorize",
            ),
            GateError::CredentialConflict => (
                StatusCode::CONFLICT,
                "conflict",
                "The brokerage credential was updated concurrently",
            ),
            GateError::ExchangeFailed(_) => (
                StatusCode::BAD_GATEWAY,
                "exchange_failed",
                "Brokerage token exchange failed",
            ),
            GateError::Brokerage(_) => (
                StatusCode::BAD_GATEWAY,
                "brokerage_error",
                "Brokerage request failed",
            ),
            GateError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Internal server error",
            ),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    error_description: &'static str,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let (status, error, error_description) = self.public_parts();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::warn!(error = %self, status = %status, "Request rejected");
        }

        (
            status,
            Json(ErrorBody {
                error,
                error_description,
            }),
        )
            .into_response()
    }
}
