//! Audit trail for approval decisions and bypasses.
//!
//! Every event is emitted through `tracing` as a JSON blob in the `audit`
//! field and kept in a bounded in-memory ring for the admin status page.
//!
//! | Event | When |
//! |-------|------|
//! | `approval.bypassed` | The no-op backend approved an action without a human |
//! | `approval.refused` | Approval is disabled and a mutating action was refused |
//! | `approval.requested` | A request was published to the approval channel |
//! | `approval.joined` | An identical in-flight request was joined instead of duplicated |
//! | `approval.duplicate` | A joined waiter was refused because the approval was already used |
//! | `approval.decided` | An allow-listed approver approved or denied a request |
//! | `approval.ignored` | A decision was dropped (not allow-listed, unknown or already resolved) |
//! | `approval.expired` | The deadline passed without a decision |
//! | `approval.abandoned` | Every waiter went away before a decision |

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Approver identity for decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(event: &'static str, action: impl Into<String>) -> Self {
        Self {
            event,
            at: Utc::now(),
            request_id: None,
            action: action.into(),
            client_id: None,
            actor: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn request(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    #[must_use]
    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Emit via tracing and remember the event. Bypasses are warnings.
    pub fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(ref json) if event.event == "approval.bypassed" => {
                tracing::warn!(audit = %json, "Human approval BYPASSED")
            }
            Ok(ref json) => tracing::info!(audit = %json, "approval audit"),
            Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
        }

        let mut events = self.events.lock().expect("audit log lock poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().expect("audit log lock poisoned");
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn count(&self, event: &str) -> usize {
        let events = self.events.lock().expect("audit log lock poisoned");
        events.iter().filter(|e| e.event == event).count()
    }
}
