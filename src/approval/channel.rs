//! Human-in-the-loop approval through an external channel.

use super::audit::AuditEvent;
use super::registry::{ApprovalRegistry, Ticket};
use super::{ActionDescriptor, ApprovalBackend, ApprovalDecision, ApprovalRequest, ApprovalStatus};
use crate::error::{GateError, GateResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Where approval requests are shown to approvers
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Announce a new request. An error fails the request closed.
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()>;

    /// Follow-up once a request is resolved. Best effort.
    async fn resolved(&self, request: &ApprovalRequest) -> anyhow::Result<()>;
}

pub struct ChannelBackend {
    registry: Arc<ApprovalRegistry>,
    channel: Arc<dyn ApprovalChannel>,
}

/// Releases one waiter slot when the waiting future finishes or is dropped.
struct WaitGuard {
    registry: Arc<ApprovalRegistry>,
    id: Uuid,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

async fn wait_resolved(receiver: &mut watch::Receiver<ApprovalStatus>) -> ApprovalStatus {
    loop {
        let status = *receiver.borrow_and_update();
        if status.is_resolved() {
            return status;
        }
        if receiver.changed().await.is_err() {
            return ApprovalStatus::Expired;
        }
    }
}

impl ChannelBackend {
    pub fn new(registry: Arc<ApprovalRegistry>, channel: Arc<dyn ApprovalChannel>) -> Self {
        Self { registry, channel }
    }

    pub fn registry(&self) -> &Arc<ApprovalRegistry> {
        &self.registry
    }

    async fn follow_up(&self, id: Uuid) {
        let Some(request) = self.registry.get(id) else {
            return;
        };
        if !request.status.is_resolved() {
            return;
        }
        if let Err(e) = self.channel.resolved(&request).await {
            warn!(approval_id = %id, error = %e, "Failed to post approval follow-up");
        }
    }
}

#[async_trait]
impl ApprovalBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn request(
        &self,
        action: &ActionDescriptor,
        client_id: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> GateResult<ApprovalDecision> {
        let Ticket {
            request,
            deadline,
            mut receiver,
            created,
        } = self.registry.open(action, client_id, timeout)?;
        let id = request.id;
        let guard = WaitGuard {
            registry: self.registry.clone(),
            id,
        };

        if created {
            if let Err(e) = self.channel.publish(&request).await {
                error!(approval_id = %id, error = %e, "Failed to publish approval request");
                self.registry.expire(id, "channel unavailable");
                return Err(GateError::ApprovalUnavailable(action.name.clone()));
            }
            self.registry.audit().record(
                AuditEvent::new("approval.requested", action.name.clone())
                    .request(id)
                    .client(client_id),
            );
        } else {
            debug!(approval_id = %id, "Joined identical in-flight approval request");
        }

        let status = tokio::select! {
            status = wait_resolved(&mut receiver) => status,
            _ = tokio::time::sleep_until(deadline) => {
                self.registry.expire(id, "deadline").unwrap_or(ApprovalStatus::Expired)
            }
            _ = cancel.cancelled() => {
                debug!(approval_id = %id, "Approval wait cancelled by caller");
                drop(guard);
                return Err(GateError::Cancelled(action.name.clone()));
            }
        };
        drop(guard);

        if created {
            self.follow_up(id).await;
        }

        match status {
            ApprovalStatus::Approved if self.registry.claim_execution(id) => Ok(ApprovalDecision {
                request_id: Some(id),
                decided_by: self.registry.get(id).and_then(|r| r.decided_by),
                bypassed: false,
            }),
            ApprovalStatus::Approved => {
                warn!(approval_id = %id, "Approval already used by an identical action");
                self.registry.audit().record(
                    AuditEvent::new("approval.duplicate", action.name.clone())
                        .request(id)
                        .client(client_id),
                );
                Err(GateError::DuplicateAction(action.name.clone()))
            }
            ApprovalStatus::Denied => Err(GateError::PermissionDenied(action.name.clone())),
            ApprovalStatus::Expired | ApprovalStatus::Pending => {
                Err(GateError::Timeout(action.name.clone()))
            }
        }
    }
}
