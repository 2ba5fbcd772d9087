use super::*;
use serde_json::json;
use std::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RecordingChannel {
    published: Mutex<Vec<ApprovalRequest>>,
    resolved: Mutex<Vec<ApprovalRequest>>,
    fail: bool,
}

#[async_trait]
impl ApprovalChannel for RecordingChannel {
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        if self.fail {
            return Err(anyhow::anyhow!("webhook down"));
        }
        self.published.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn resolved(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        self.resolved.lock().unwrap().push(request.clone());
        Ok(())
    }
}

struct Harness {
    backend: Arc<ChannelBackend>,
    registry: Arc<ApprovalRegistry>,
    channel: Arc<RecordingChannel>,
}

fn harness_with(channel: RecordingChannel, max_pending: usize) -> Harness {
    let audit = Arc::new(AuditLog::default());
    let registry = Arc::new(ApprovalRegistry::new(
        ["alice", "bob"],
        max_pending,
        chrono::Duration::hours(1),
        audit,
    ));
    let channel = Arc::new(channel);
    let backend = Arc::new(ChannelBackend::new(registry.clone(), channel.clone()));
    Harness {
        backend,
        registry,
        channel,
    }
}

fn harness() -> Harness {
    harness_with(RecordingChannel::default(), 100)
}

fn order(qty: u64) -> ActionDescriptor {
    ActionDescriptor::new("place_order", json!({"symbol": "AAPL", "qty": qty}))
}

fn spawn_request(
    h: &Harness,
    action: ActionDescriptor,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<GateResult<ApprovalDecision>> {
    let backend = h.backend.clone();
    tokio::spawn(async move { backend.request(&action, "bgc_1", timeout, cancel).await })
}

async fn wait_published(h: &Harness, count: usize) -> Vec<ApprovalRequest> {
    loop {
        let published = h.channel.published.lock().unwrap().clone();
        if published.len() >= count {
            return published;
        }
        tokio::task::yield_now().await;
    }
}

const TEN_MINUTES: Duration = Duration::from_secs(600);

#[tokio::test]
async fn approval_from_allow_listed_approver() {
    let h = harness();
    let task = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    assert_eq!(
        h.registry.decide(id, "alice", Verdict::Approve),
        DecisionOutcome::Applied(ApprovalStatus::Approved)
    );

    let decision = task.await.unwrap().unwrap();
    assert_eq!(decision.request_id, Some(id));
    assert_eq!(decision.decided_by.as_deref(), Some("alice"));
    assert!(!decision.bypassed);
    assert_eq!(h.channel.resolved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn denial_is_permission_denied() {
    let h = harness();
    let task = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    h.registry.decide(id, "bob", Verdict::Deny);

    assert!(matches!(
        task.await.unwrap(),
        Err(GateError::PermissionDenied(_))
    ));
    assert_eq!(h.registry.get(id).unwrap().status, ApprovalStatus::Denied);
}

#[tokio::test]
async fn no_decision_before_deadline_times_out() {
    let h = harness();
    let task = spawn_request(&h, order(1), Duration::from_millis(50), CancellationToken::new());

    let result = task.await.unwrap();
    assert!(matches!(result, Err(GateError::Timeout(_))));

    let id = h.channel.published.lock().unwrap()[0].id;
    let request = h.registry.get(id).unwrap();
    assert_eq!(request.status, ApprovalStatus::Expired);
    assert_eq!(request.reason.as_deref(), Some("deadline"));
}

#[tokio::test]
async fn outsider_decision_is_ignored() {
    let h = harness();
    let task = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    assert_eq!(
        h.registry.decide(id, "mallory", Verdict::Approve),
        DecisionOutcome::Ignored(IgnoreReason::NotAllowed)
    );
    assert_eq!(h.registry.get(id).unwrap().status, ApprovalStatus::Pending);
    assert!(!task.is_finished());

    h.registry.decide(id, "alice", Verdict::Deny);
    assert!(matches!(
        task.await.unwrap(),
        Err(GateError::PermissionDenied(_))
    ));
    assert_eq!(h.registry.audit().count("approval.ignored"), 1);
}

#[tokio::test]
async fn second_decision_is_a_no_op() {
    let h = harness();
    let task = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    h.registry.decide(id, "alice", Verdict::Approve);
    assert_eq!(
        h.registry.decide(id, "bob", Verdict::Deny),
        DecisionOutcome::Ignored(IgnoreReason::AlreadyResolved)
    );

    assert!(task.await.unwrap().is_ok());
    let request = h.registry.get(id).unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(request.decided_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn unknown_request_is_ignored() {
    let h = harness();
    assert_eq!(
        h.registry.decide(Uuid::new_v4(), "alice", Verdict::Approve),
        DecisionOutcome::Ignored(IgnoreReason::UnknownRequest)
    );
}

#[tokio::test]
async fn identical_requests_share_one_approval() {
    let h = harness();
    let first = spawn_request(&h, order(5), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;
    let second = spawn_request(&h, order(5), TEN_MINUTES, CancellationToken::new());

    while h.registry.audit().count("approval.joined") == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.registry.pending().len(), 1);

    h.registry.decide(id, "alice", Verdict::Approve);

    let results = [first.await.unwrap(), second.await.unwrap()];
    let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].request_id, Some(id));
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(GateError::DuplicateAction(_))))
            .count(),
        1
    );
    assert_eq!(h.channel.published.lock().unwrap().len(), 1);
    assert_eq!(h.registry.audit().count("approval.duplicate"), 1);
}

#[tokio::test]
async fn approval_is_claimed_once() {
    let h = harness();
    let task = spawn_request(&h, order(4), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    assert!(!h.registry.claim_execution(id));
    h.registry.decide(id, "alice", Verdict::Approve);
    assert!(task.await.unwrap().is_ok());

    assert!(!h.registry.claim_execution(id));
    assert!(!h.registry.claim_execution(Uuid::new_v4()));
}

#[tokio::test]
async fn different_parameters_are_separate_requests() {
    let h = harness();
    let _a = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let _b = spawn_request(&h, order(2), TEN_MINUTES, CancellationToken::new());

    wait_published(&h, 2).await;
    assert_eq!(h.registry.pending().len(), 2);
}

#[tokio::test]
async fn cancellation_abandons_request() {
    let h = harness();
    let cancel = CancellationToken::new();
    let task = spawn_request(&h, order(1), TEN_MINUTES, cancel.clone());
    let id = wait_published(&h, 1).await[0].id;

    cancel.cancel();

    assert!(matches!(task.await.unwrap(), Err(GateError::Cancelled(_))));
    let request = h.registry.get(id).unwrap();
    assert_eq!(request.status, ApprovalStatus::Expired);
    assert_eq!(request.reason.as_deref(), Some("abandoned"));
    assert!(h.registry.pending().is_empty());
}

#[tokio::test]
async fn dropped_waiter_abandons_request() {
    let h = harness();
    let task = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    let id = wait_published(&h, 1).await[0].id;

    task.abort();
    let _ = task.await;

    assert_eq!(h.registry.get(id).unwrap().status, ApprovalStatus::Expired);
    assert_eq!(h.registry.audit().count("approval.abandoned"), 1);
}

#[tokio::test]
async fn one_waiter_leaving_keeps_shared_request_alive() {
    let h = harness();
    let cancel = CancellationToken::new();
    let first = spawn_request(&h, order(3), TEN_MINUTES, cancel.clone());
    let id = wait_published(&h, 1).await[0].id;
    let second = spawn_request(&h, order(3), TEN_MINUTES, CancellationToken::new());
    while h.registry.audit().count("approval.joined") == 0 {
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    assert!(matches!(first.await.unwrap(), Err(GateError::Cancelled(_))));
    assert_eq!(h.registry.get(id).unwrap().status, ApprovalStatus::Pending);

    h.registry.decide(id, "alice", Verdict::Approve);
    assert!(second.await.unwrap().is_ok());
}

#[tokio::test]
async fn publish_failure_fails_closed() {
    let h = harness_with(
        RecordingChannel {
            fail: true,
            ..Default::default()
        },
        100,
    );

    let result = h
        .backend
        .request(&order(1), "bgc_1", TEN_MINUTES, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(GateError::ApprovalUnavailable(_))));
    assert!(h.registry.pending().is_empty());
}

#[tokio::test]
async fn full_registry_refuses_new_requests() {
    let h = harness_with(RecordingChannel::default(), 1);
    let _held = spawn_request(&h, order(1), TEN_MINUTES, CancellationToken::new());
    wait_published(&h, 1).await;

    let result = h
        .backend
        .request(&order(2), "bgc_1", TEN_MINUTES, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(GateError::ApprovalUnavailable(_))));
}

#[tokio::test]
async fn sweep_forgets_resolved_requests_after_retention() {
    let audit = Arc::new(AuditLog::default());
    let registry = ApprovalRegistry::new(["alice"], 10, chrono::Duration::zero(), audit);

    let ticket = registry.open(&order(1), "bgc_1", TEN_MINUTES).unwrap();
    let id = ticket.request.id;
    registry.decide(id, "alice", Verdict::Approve);

    assert_eq!(registry.sweep(), 1);
    assert!(registry.get(id).is_none());
}

#[tokio::test]
async fn noop_backend_audits_every_bypass() {
    let audit = Arc::new(AuditLog::default());
    let backend = NoOpBackend::new(audit.clone());

    for _ in 0..3 {
        let decision = backend
            .request(&order(1), "bgc_1", TEN_MINUTES, CancellationToken::new())
            .await
            .unwrap();
        assert!(decision.bypassed);
    }

    assert_eq!(audit.count("approval.bypassed"), 3);
    assert_eq!(audit.recent(10).len(), 3);
}

#[tokio::test]
async fn disabled_backend_refuses() {
    let audit = Arc::new(AuditLog::default());
    let backend = DisabledBackend::new(audit.clone());

    let result = backend
        .request(&order(1), "bgc_1", TEN_MINUTES, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(GateError::PermissionDenied(_))));
    assert_eq!(audit.count("approval.refused"), 1);
}

#[test]
fn fingerprint_ignores_key_order() {
    let a = ActionDescriptor::new("place_order", json!({"symbol": "AAPL", "qty": 1}));
    let b = ActionDescriptor::new("place_order", json!({"qty": 1, "symbol": "AAPL"}));
    let c = ActionDescriptor::new("place_order", json!({"qty": 2, "symbol": "AAPL"}));

    assert_eq!(a.fingerprint("bgc_1"), b.fingerprint("bgc_1"));
    assert_ne!(a.fingerprint("bgc_1"), c.fingerprint("bgc_1"));
    assert_ne!(a.fingerprint("bgc_1"), a.fingerprint("bgc_2"));
}
