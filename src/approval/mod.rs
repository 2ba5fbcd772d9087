//! Human approval in front of mutating actions.
//!
//! [`ApprovalBackend::request`] is the suspension point: it returns once the
//! action is approved, and fails with `PermissionDenied`, `Timeout` or
//! `Cancelled` otherwise. Which backend runs is an operator decision:
//!
//! - [`ChannelBackend`]: a human on the allow-list decides through an external channel
//! - [`NoOpBackend`]: everything is approved, and every bypass is audited
//! - [`DisabledBackend`]: every mutating action is refused

mod audit;
mod channel;
mod registry;
mod webhook;

#[cfg(test)]
mod tests;

pub use audit::{AuditEvent, AuditLog, DEFAULT_AUDIT_CAPACITY};
pub use channel::{ApprovalChannel, ChannelBackend};
pub use registry::{run_registry_sweep, ApprovalRegistry, DecisionOutcome, IgnoreReason, Ticket};
pub use webhook::WebhookChannel;

use crate::error::{GateError, GateResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `(action name, structured parameters)` as supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Identity of "the same action from the same client". Object keys are
    /// serialised in sorted order, so parameter order does not matter.
    pub fn fingerprint(&self, client_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.params.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(client_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn is_resolved(self) -> bool {
        self != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Deny,
}

/// One human decision for one mutating action. Immutable once resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub action: ActionDescriptor,
    pub client_id: String,
    pub fingerprint: String,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Why an EXPIRED request expired (`deadline`, `abandoned`, ...)
    pub reason: Option<String>,
}

/// A granted approval
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    /// None when no request was raised (bypass)
    pub request_id: Option<Uuid>,
    pub decided_by: Option<String>,
    pub bypassed: bool,
}

#[async_trait]
pub trait ApprovalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Suspend until `action` is approved, denied, times out or `cancel` fires.
    async fn request(
        &self,
        action: &ActionDescriptor,
        client_id: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> GateResult<ApprovalDecision>;
}

/// Approves everything. Only constructed when the operator turns human
/// oversight off, and every call leaves an `approval.bypassed` record.
pub struct NoOpBackend {
    audit: Arc<AuditLog>,
}

impl NoOpBackend {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        tracing::warn!("Approval backend is NO-OP: mutating actions run without human approval");
        Self { audit }
    }
}

#[async_trait]
impl ApprovalBackend for NoOpBackend {
    fn name(&self) -> &'static str {
        "bypass"
    }

    async fn request(
        &self,
        action: &ActionDescriptor,
        client_id: &str,
        _timeout: Duration,
        _cancel: CancellationToken,
    ) -> GateResult<ApprovalDecision> {
        self.audit.record(
            AuditEvent::new("approval.bypassed", action.name.clone())
                .client(client_id)
                .reason("approval mode is bypass"),
        );

        Ok(ApprovalDecision {
            request_id: None,
            decided_by: None,
            bypassed: true,
        })
    }
}

/// Refuses every mutating action.
pub struct DisabledBackend {
    audit: Arc<AuditLog>,
}

impl DisabledBackend {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl ApprovalBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn request(
        &self,
        action: &ActionDescriptor,
        client_id: &str,
        _timeout: Duration,
        _cancel: CancellationToken,
    ) -> GateResult<ApprovalDecision> {
        self.audit.record(
            AuditEvent::new("approval.refused", action.name.clone())
                .client(client_id)
                .reason("approval mode is disabled"),
        );

        Err(GateError::PermissionDenied(format!(
            "{} refused: mutating actions are disabled",
            action.name
        )))
    }
}
