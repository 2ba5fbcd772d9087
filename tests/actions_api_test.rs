// Integration tests for /api/actions and /approvals/:id/decision

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use brokergate::api::{sign, SIGNATURE_HEADER};
use brokergate::approval::ApprovalRequest;
use brokergate::config::ApprovalMode;
use common::*;
use serde_json::{json, Value};
use std::time::Duration;

fn place_order() -> Value {
    json!({
        "name": "place_order",
        "params": {
            "account_hash": "H",
            "order": {"orderType": "LIMIT", "price": "10.00", "quantity": 5}
        }
    })
}

async fn access_token(router: &Router) -> String {
    obtain_tokens(router).await["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Wait until the channel has published `count` approval requests
async fn published(app: &TestApp, count: usize) -> ApprovalRequest {
    for _ in 0..200 {
        {
            let published = app.channel.published.lock().unwrap();
            if published.len() >= count {
                return published[count - 1].clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("approval request was never published");
}

fn decision(id: &str, approver: &str, verdict: &str, secret: Option<&str>) -> Request<Body> {
    let body = json!({"approver": approver, "verdict": verdict}).to_string();
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/approvals/{}/decision", id))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(secret) = secret {
        builder = builder.header(SIGNATURE_HEADER, sign(secret, body.as_bytes()).unwrap());
    }
    builder.body(Body::from(body)).unwrap()
}

fn spawn_action(app: &TestApp, token: &str, body: Value) -> tokio::task::JoinHandle<Reply> {
    let router = app.router.clone();
    let request = with_bearer(post_json("/api/actions", &body), token);
    tokio::spawn(async move { send(&router, request).await })
}

#[tokio::test]
async fn test_missing_bearer_gets_resource_metadata_challenge() {
    let app = build(Options::default());

    let reply = send(&app.router, post_json("/api/actions", &place_order())).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        reply.headers[header::WWW_AUTHENTICATE],
        "Bearer resource_metadata=\"https://gate.example/.well-known/oauth-protected-resource\""
    );

    let reply = send(
        &app.router,
        with_bearer(get("/api/actions"), "not-a-real-token"),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert!(reply.headers.contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(app.brokerage.count(), 0);
}

#[tokio::test]
async fn test_list_actions() {
    let app = build(Options::default());
    let token = access_token(&app.router).await;

    let reply = send(&app.router, with_bearer(get("/api/actions"), &token)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let actions = reply.json()["actions"].as_array().unwrap().clone();
    let place = actions
        .iter()
        .find(|a| a["name"] == "place_order")
        .unwrap();
    assert_eq!(place["effect"], "mutate");
    assert_eq!(place["method"], "POST");
}

#[tokio::test]
async fn test_read_action_skips_approval() {
    let app = build(Options::default());
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let reply = send(
        &app.router,
        with_bearer(
            post_json("/api/actions", &json!({"name": "get_account_numbers"})),
            &token,
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text());
    assert_eq!(reply.json()["effect"], "read");
    assert!(reply.json().get("approval").is_none());
    assert_eq!(app.brokerage.count(), 1);
    assert!(app.channel.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_signed_approval_releases_mutation() {
    let app = build(Options::default());
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let pending = spawn_action(&app, &token, place_order());
    let request = published(&app, 1).await;
    let id = request.id.to_string();
    assert_eq!(app.brokerage.count(), 0);

    // Unsigned and wrongly signed decisions are refused outright
    let reply = send(&app.router, decision(&id, "alice", "approve", None)).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let reply = send(&app.router, decision(&id, "alice", "approve", Some("wrong"))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    // Only listed approvers count
    let reply = send(&app.router, decision(&id, "mallory", "approve", Some(SIGNING_SECRET))).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(app.brokerage.count(), 0);

    let reply = send(&app.router, decision(&id, "alice", "approve", Some(SIGNING_SECRET))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["outcome"], "applied");

    let reply = pending.await.unwrap();
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text());
    let outcome = reply.json();
    assert_eq!(outcome["approval"]["decided_by"], "alice");
    assert_eq!(
        outcome["location"],
        "https://broker.example/trader/v1/accounts/H/orders/991"
    );
    assert_eq!(app.brokerage.count(), 1);

    // A second decision on a resolved request conflicts
    let reply = send(&app.router, decision(&id, "alice", "deny", Some(SIGNING_SECRET))).await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_denied_mutation_never_reaches_brokerage() {
    let app = build(Options::default());
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let pending = spawn_action(&app, &token, place_order());
    let request = published(&app, 1).await;

    let reply = send(
        &app.router,
        decision(&request.id.to_string(), "alice", "deny", Some(SIGNING_SECRET)),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = pending.await.unwrap();
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.json()["error"], "permission_denied");
    assert_eq!(app.brokerage.count(), 0);
}

#[tokio::test]
async fn test_unanswered_approval_times_out() {
    let app = build(Options {
        approval_timeout: Duration::from_millis(100),
        ..Options::default()
    });
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let reply = send(
        &app.router,
        with_bearer(post_json("/api/actions", &place_order()), &token),
    )
    .await;
    assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(reply.json()["error"], "approval_timeout");
    assert_eq!(app.brokerage.count(), 0);
}

#[tokio::test]
async fn test_stale_credential_fails_before_approval() {
    let app = build(Options::default());
    seed_credential(&app.store, chrono::Duration::days(8));
    let token = access_token(&app.router).await;

    let reply = send(
        &app.router,
        with_bearer(post_json("/api/actions", &place_order()), &token),
    )
    .await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.json()["error"], "credential_stale");
    assert!(app.channel.published.lock().unwrap().is_empty());
    assert_eq!(app.brokerage.count(), 0);
}

#[tokio::test]
async fn test_bypass_mode_is_audited() {
    let app = build(Options {
        mode: ApprovalMode::Bypass,
        ..Options::default()
    });
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let reply = send(
        &app.router,
        with_bearer(post_json("/api/actions", &place_order()), &token),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text());
    assert_eq!(reply.json()["approval"]["bypassed"], true);
    assert_eq!(app.audit.count("approval.bypassed"), 1);

    // Decisions have nowhere to go without a registry
    let reply = send(
        &app.router,
        decision(&uuid::Uuid::new_v4().to_string(), "alice", "approve", Some(SIGNING_SECRET)),
    )
    .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_action_requests() {
    let app = build(Options::default());
    seed_credential(&app.store, chrono::Duration::hours(1));
    let token = access_token(&app.router).await;

    let reply = send(
        &app.router,
        with_bearer(post_json("/api/actions", &json!({"name": "transfer_funds"})), &token),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    // Missing path parameter
    let reply = send(
        &app.router,
        with_bearer(
            post_json("/api/actions", &json!({"name": "get_orders", "params": {}})),
            &token,
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/api/actions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::from("{not json"))
        .unwrap();
    let reply = send(&app.router, request).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.brokerage.count(), 0);
}
