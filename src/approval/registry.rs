//! In-flight and recently resolved approval requests.
//!
//! Each request owns a `watch` channel carrying its status. Waiters hold a
//! receiver, the decision path writes the sender. A request resolves at most
//! once; everything after that is reported back as ignored.

use super::audit::{AuditEvent, AuditLog};
use super::{ActionDescriptor, ApprovalRequest, ApprovalStatus, Verdict};
use crate::error::{GateError, GateResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NotAllowed,
    UnknownRequest,
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Applied(ApprovalStatus),
    Ignored(IgnoreReason),
}

/// A waiter's handle on a request
pub struct Ticket {
    pub request: ApprovalRequest,
    pub deadline: Instant,
    pub receiver: watch::Receiver<ApprovalStatus>,
    /// False when an identical in-flight request was joined
    pub created: bool,
}

struct Entry {
    request: ApprovalRequest,
    deadline: Instant,
    sender: watch::Sender<ApprovalStatus>,
    waiters: usize,
    /// Set once a waiter has taken the approval to execute the action
    claimed: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    /// fingerprint → pending request id
    in_flight: HashMap<String, Uuid>,
}

pub struct ApprovalRegistry {
    inner: Mutex<Inner>,
    approvers: HashSet<String>,
    max_entries: usize,
    retention: chrono::Duration,
    audit: Arc<AuditLog>,
}

fn resolve(
    entry: &mut Entry,
    in_flight: &mut HashMap<String, Uuid>,
    status: ApprovalStatus,
    decided_by: Option<&str>,
    reason: Option<&str>,
) {
    entry.request.status = status;
    entry.request.decided_by = decided_by.map(str::to_string);
    entry.request.reason = reason.map(str::to_string);
    entry.request.resolved_at = Some(Utc::now());
    entry.sender.send_replace(status);
    in_flight.remove(&entry.request.fingerprint);
}

impl ApprovalRegistry {
    pub fn new<I, S>(approvers: I, max_entries: usize, retention: chrono::Duration, audit: Arc<AuditLog>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let approvers = approvers
            .into_iter()
            .map(|a| a.as_ref().trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        Self {
            inner: Mutex::new(Inner::default()),
            approvers,
            max_entries: max_entries.max(1),
            retention,
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn is_approver(&self, identity: &str) -> bool {
        self.approvers.contains(identity.trim())
    }

    /// Register interest in an approval for `action`. An identical request
    /// that is still pending is joined rather than raised twice.
    pub fn open(&self, action: &ActionDescriptor, client_id: &str, timeout: Duration) -> GateResult<Ticket> {
        let fingerprint = action.fingerprint(client_id);
        let mut guard = self.inner.lock().expect("approval registry lock poisoned");
        let inner = &mut *guard;

        if let Some(id) = inner.in_flight.get(&fingerprint).copied() {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.waiters += 1;
                self.audit.record(
                    AuditEvent::new("approval.joined", action.name.clone())
                        .request(id)
                        .client(client_id),
                );
                return Ok(Ticket {
                    request: entry.request.clone(),
                    deadline: entry.deadline,
                    receiver: entry.sender.subscribe(),
                    created: false,
                });
            }
        }

        if inner.entries.len() >= self.max_entries {
            self.prune_locked(inner, true);
        }
        if inner.entries.len() >= self.max_entries {
            warn!(max = self.max_entries, "Approval registry full, refusing new request");
            return Err(GateError::ApprovalUnavailable(
                "too many pending approvals".to_string(),
            ));
        }

        let now = Utc::now();
        let chrono_timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            action: action.clone(),
            client_id: client_id.to_string(),
            fingerprint: fingerprint.clone(),
            requested_at: now,
            deadline: now + chrono_timeout,
            status: ApprovalStatus::Pending,
            decided_by: None,
            resolved_at: None,
            reason: None,
        };

        let (sender, receiver) = watch::channel(ApprovalStatus::Pending);
        let deadline = Instant::now() + timeout;

        inner.in_flight.insert(fingerprint, request.id);
        inner.entries.insert(
            request.id,
            Entry {
                request: request.clone(),
                deadline,
                sender,
                waiters: 1,
                claimed: false,
            },
        );

        Ok(Ticket {
            request,
            deadline,
            receiver,
            created: true,
        })
    }

    /// Apply a decision from `approver`. Identities outside the allow-list
    /// never touch the request.
    pub fn decide(&self, id: Uuid, approver: &str, verdict: Verdict) -> DecisionOutcome {
        let mut guard = self.inner.lock().expect("approval registry lock poisoned");
        let inner = &mut *guard;

        let action_name = inner
            .entries
            .get(&id)
            .map(|e| e.request.action.name.clone())
            .unwrap_or_default();

        let ignored = |reason: IgnoreReason, detail: &str| {
            warn!(approval_id = %id, approver = %approver, ?reason, "Approval decision ignored");
            self.audit.record(
                AuditEvent::new("approval.ignored", action_name.clone())
                    .request(id)
                    .actor(approver)
                    .reason(detail),
            );
            DecisionOutcome::Ignored(reason)
        };

        if !self.is_approver(approver) {
            return ignored(IgnoreReason::NotAllowed, "approver not on allow-list");
        }

        let Some(entry) = inner.entries.get_mut(&id) else {
            return ignored(IgnoreReason::UnknownRequest, "unknown request");
        };

        if entry.request.status.is_resolved() {
            return ignored(IgnoreReason::AlreadyResolved, "request already resolved");
        }

        let status = match verdict {
            Verdict::Approve => ApprovalStatus::Approved,
            Verdict::Deny => ApprovalStatus::Denied,
        };
        resolve(entry, &mut inner.in_flight, status, Some(approver.trim()), None);

        info!(approval_id = %id, approver = %approver, ?status, "Approval decided");
        self.audit.record(
            AuditEvent::new("approval.decided", action_name)
                .request(id)
                .client(entry.request.client_id.clone())
                .actor(approver.trim())
                .reason(if status == ApprovalStatus::Approved {
                    "approved"
                } else {
                    "denied"
                }),
        );

        DecisionOutcome::Applied(status)
    }

    /// Resolve a still-pending request as EXPIRED. Returns the final status,
    /// which is the decision if one won the race.
    pub fn expire(&self, id: Uuid, reason: &str) -> Option<ApprovalStatus> {
        let mut guard = self.inner.lock().expect("approval registry lock poisoned");
        let inner = &mut *guard;
        let entry = inner.entries.get_mut(&id)?;

        if entry.request.status.is_resolved() {
            return Some(entry.request.status);
        }

        resolve(entry, &mut inner.in_flight, ApprovalStatus::Expired, None, Some(reason));

        let event = if reason == "abandoned" {
            "approval.abandoned"
        } else {
            "approval.expired"
        };
        warn!(approval_id = %id, reason, "Approval request expired");
        self.audit.record(
            AuditEvent::new(event, entry.request.action.name.clone())
                .request(id)
                .client(entry.request.client_id.clone())
                .reason(reason),
        );

        Some(ApprovalStatus::Expired)
    }

    /// A waiter went away. The last one leaving a pending request abandons it.
    pub fn release(&self, id: Uuid) {
        let last_waiter = {
            let mut guard = self.inner.lock().expect("approval registry lock poisoned");
            match guard.entries.get_mut(&id) {
                Some(entry) => {
                    entry.waiters = entry.waiters.saturating_sub(1);
                    entry.waiters == 0 && !entry.request.status.is_resolved()
                }
                None => false,
            }
        };

        if last_waiter {
            self.expire(id, "abandoned");
        }
    }

    /// Take an APPROVED request for execution. Only the first caller gets
    /// true; one approval releases one action, however many waiters joined.
    pub fn claim_execution(&self, id: Uuid) -> bool {
        let mut guard = self.inner.lock().expect("approval registry lock poisoned");
        match guard.entries.get_mut(&id) {
            Some(entry) if entry.request.status == ApprovalStatus::Approved && !entry.claimed => {
                entry.claimed = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        let guard = self.inner.lock().expect("approval registry lock poisoned");
        guard.entries.get(&id).map(|e| e.request.clone())
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let guard = self.inner.lock().expect("approval registry lock poisoned");
        let mut pending: Vec<_> = guard
            .entries
            .values()
            .filter(|e| !e.request.status.is_resolved())
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    /// Drop resolved records past retention. With `force`, when that is not
    /// enough, drop the oldest resolved records as well.
    fn prune_locked(&self, inner: &mut Inner, force: bool) -> usize {
        let now = Utc::now();
        let before = inner.entries.len();
        let retention = self.retention;

        inner.entries.retain(|_, e| match e.request.resolved_at {
            Some(at) => at + retention > now,
            None => true,
        });

        if force && inner.entries.len() >= self.max_entries {
            let mut resolved: Vec<_> = inner
                .entries
                .values()
                .filter_map(|e| e.request.resolved_at.map(|at| (at, e.request.id)))
                .collect();
            resolved.sort();
            let excess = inner.entries.len() + 1 - self.max_entries;
            for (_, id) in resolved.into_iter().take(excess) {
                inner.entries.remove(&id);
            }
        }

        before - inner.entries.len()
    }

    /// Periodic maintenance: expire overdue requests nobody waits for and
    /// forget resolved ones past retention.
    pub fn sweep(&self) -> usize {
        let overdue: Vec<Uuid> = {
            let guard = self.inner.lock().expect("approval registry lock poisoned");
            let now = Instant::now();
            guard
                .entries
                .values()
                .filter(|e| !e.request.status.is_resolved() && e.waiters == 0 && e.deadline <= now)
                .map(|e| e.request.id)
                .collect()
        };
        for id in overdue {
            self.expire(id, "deadline");
        }

        let mut guard = self.inner.lock().expect("approval registry lock poisoned");
        self.prune_locked(&mut guard, false)
    }
}

/// Background task sweeping the approval registry
pub async fn run_registry_sweep(registry: Arc<ApprovalRegistry>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = registry.sweep();
        if removed > 0 {
            tracing::debug!(removed, "Swept resolved approval requests");
        }
    }
}
