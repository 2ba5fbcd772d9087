use super::*;
use crate::credentials::SqliteTokenStore;
use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::atomic::{AtomicUsize, Ordering};

type ExchangeHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct StubTokenClient {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
    fail_exchange: bool,
    fail_refresh: bool,
    rotate_refresh: bool,
    refresh_delay_ms: u64,
    on_exchange: Option<ExchangeHook>,
}

#[async_trait]
impl BrokerTokenClient for StubTokenClient {
    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> anyhow::Result<TokenGrant> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_exchange {
            hook();
        }
        if self.fail_exchange {
            return Err(anyhow!("400 invalid_grant"));
        }
        Ok(TokenGrant {
            access_token: format!("at-for-{}", code),
            refresh_token: Some(format!("rt-for-{}", code)),
            expires_in: Some(1800),
            token_type: Some("Bearer".to_string()),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<TokenGrant> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refresh_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.refresh_delay_ms)).await;
        }
        if self.fail_refresh {
            return Err(anyhow!("503 upstream unavailable"));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: self.rotate_refresh.then(|| format!("rotated-{}", n)),
            expires_in: Some(1800),
            token_type: None,
        })
    }
}

fn memory_store() -> Arc<SqliteTokenStore> {
    Arc::new(SqliteTokenStore::new(":memory:", &BASE64.encode([0u8; 32])).unwrap())
}

fn provider() -> BrokerProvider {
    BrokerProvider {
        authorize_url: "https://broker.example/oauth/authorize".to_string(),
        token_url: "https://broker.example/oauth/token".to_string(),
        client_id: "app".to_string(),
        client_secret: "secret".to_string(),
        callback_url: "https://gate.example/admin/broker/callback".to_string(),
        scopes: vec![],
    }
}

fn policy() -> CredentialPolicy {
    CredentialPolicy {
        max_age: Duration::days(5),
        refresh_skew: Duration::seconds(90),
    }
}

fn flow_with(client: Arc<StubTokenClient>, store: Arc<SqliteTokenStore>) -> BrokerAuthFlow {
    BrokerAuthFlow::new(
        provider(),
        StateManager::new(600, 50),
        client,
        store,
        policy(),
    )
}

fn state_from_url(url: &str) -> String {
    let query = url.split_once('?').unwrap().1;
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
    params
        .into_iter()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v)
        .unwrap()
}

fn seed(store: &SqliteTokenStore, age: Duration, expires_in: Duration) -> u64 {
    let now = Utc::now();
    let mut credential = BrokerageCredential::issued(
        "seed-access".to_string(),
        Some("seed-refresh".to_string()),
        Some(now + expires_in),
    );
    credential.created_at = now - age;
    store.save(&credential, None).unwrap()
}

#[tokio::test]
async fn begin_then_complete_stores_credential() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    let flow = flow_with(client.clone(), store.clone());

    let url = flow.begin("operator");
    assert!(url.starts_with("https://broker.example/oauth/authorize?"));
    let state = state_from_url(&url);

    let credential = flow.complete(&state, "abc").await.unwrap();
    assert_eq!(credential.access_token, "at-for-abc");

    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.credential.access_token, "at-for-abc");
    assert_eq!(stored.version, 1);

    // The state was consumed
    assert!(matches!(
        flow.complete(&state, "abc").await,
        Err(GateError::InvalidState)
    ));
}

#[tokio::test]
async fn unknown_state_fails_without_exchange() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::minutes(30));
    let flow = flow_with(client.clone(), store.clone());

    let _ = flow.begin("operator");
    let before = store.load().unwrap();

    let result = flow.complete("xyz999", "code").await;

    assert!(matches!(result, Err(GateError::InvalidState)));
    assert_eq!(client.exchanges.load(Ordering::SeqCst), 0);
    assert_eq!(store.load().unwrap(), before);
    // The legitimate pending state is still there
    assert_eq!(flow.states().count(), 1);
}

#[tokio::test]
async fn failed_exchange_leaves_credential_untouched() {
    let client = Arc::new(StubTokenClient {
        fail_exchange: true,
        ..Default::default()
    });
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::minutes(30));
    let flow = flow_with(client, store.clone());

    let state = state_from_url(&flow.begin("operator"));
    let result = flow.complete(&state, "code").await;

    assert!(matches!(result, Err(GateError::ExchangeFailed(_))));
    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.credential.access_token, "seed-access");
}

#[tokio::test]
async fn competing_completion_during_exchange_wins() {
    let store = memory_store();
    let racer_store = store.clone();
    let client = Arc::new(StubTokenClient {
        on_exchange: Some(Box::new(move || {
            // Another instance finishes its own authorization first
            let other = BrokerageCredential::issued("other-instance".to_string(), None, None);
            racer_store.save(&other, None).unwrap();
        })),
        ..Default::default()
    });
    let flow = flow_with(client, store.clone());

    let state = state_from_url(&flow.begin("operator"));
    let result = flow.complete(&state, "late").await;

    assert!(matches!(result, Err(GateError::CredentialConflict)));
    assert_eq!(
        store.load().unwrap().unwrap().credential.access_token,
        "other-instance"
    );
}

#[tokio::test]
async fn stale_credential_refused() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(6), Duration::minutes(30));
    let flow = flow_with(client.clone(), store);

    assert!(matches!(
        flow.credential_for_use().await,
        Err(GateError::Stale { .. })
    ));
    assert!(matches!(flow.check_usable(), Err(GateError::Stale { .. })));
    assert_eq!(client.refreshes.load(Ordering::SeqCst), 0);
    assert!(flow.status().unwrap().stale);
}

#[tokio::test]
async fn missing_credential_reported() {
    let flow = flow_with(Arc::new(StubTokenClient::default()), memory_store());

    assert!(matches!(
        flow.credential_for_use().await,
        Err(GateError::MissingCredential)
    ));
    assert!(!flow.status().unwrap().exists);
}

#[tokio::test]
async fn fresh_access_token_used_as_is() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::minutes(30));
    let flow = flow_with(client.clone(), store);

    let credential = flow.credential_for_use().await.unwrap();
    assert_eq!(credential.access_token, "seed-access");
    assert_eq!(client.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn near_expiry_refresh_keeps_created_at_and_refresh_token() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(2), Duration::seconds(30));
    let created_before = store.load().unwrap().unwrap().credential.created_at;
    let flow = flow_with(client.clone(), store.clone());

    let credential = flow.credential_for_use().await.unwrap();

    assert_eq!(credential.access_token, "refreshed-1");
    assert_eq!(credential.refresh_token.as_deref(), Some("seed-refresh"));
    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.credential.created_at, created_before);
}

#[tokio::test]
async fn rotated_refresh_token_is_stored() {
    let client = Arc::new(StubTokenClient {
        rotate_refresh: true,
        ..Default::default()
    });
    let store = memory_store();
    seed(&store, Duration::days(2), Duration::seconds(30));
    let flow = flow_with(client, store);

    let credential = flow.credential_for_use().await.unwrap();
    assert_eq!(credential.refresh_token.as_deref(), Some("rotated-1"));
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let client = Arc::new(StubTokenClient {
        refresh_delay_ms: 50,
        ..Default::default()
    });
    let store = memory_store();
    seed(&store, Duration::days(2), Duration::seconds(10));
    let flow = Arc::new(flow_with(client.clone(), store.clone()));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let flow = flow.clone();
            tokio::spawn(async move { flow.credential_for_use().await })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    for result in results {
        let credential = result.unwrap().unwrap();
        assert_eq!(credential.access_token, "refreshed-1");
    }

    assert_eq!(client.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(store.load().unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn failed_refresh_leaves_credential_untouched() {
    let client = Arc::new(StubTokenClient {
        fail_refresh: true,
        ..Default::default()
    });
    let store = memory_store();
    seed(&store, Duration::days(2), Duration::seconds(10));
    let flow = flow_with(client, store.clone());

    assert!(matches!(
        flow.credential_for_use().await,
        Err(GateError::ExchangeFailed(_))
    ));
    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.credential.access_token, "seed-access");
}

#[tokio::test]
async fn force_refresh_skips_when_already_replaced() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::minutes(30));
    let flow = flow_with(client.clone(), store);

    let refreshed = flow.force_refresh("seed-access").await.unwrap();
    assert_eq!(refreshed.access_token, "refreshed-1");

    // A second caller holding the old token gets the new one without a call
    let again = flow.force_refresh("seed-access").await.unwrap();
    assert_eq!(again.access_token, "refreshed-1");
    assert_eq!(client.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn maintain_refreshes_near_expiry() {
    let client = Arc::new(StubTokenClient::default());
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::seconds(10));
    let flow = flow_with(client.clone(), store);

    flow.maintain().await;
    assert_eq!(client.refreshes.load(Ordering::SeqCst), 1);

    // Nothing to do now
    flow.maintain().await;
    assert_eq!(client.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_removes_credential() {
    let store = memory_store();
    seed(&store, Duration::days(1), Duration::minutes(30));
    let flow = flow_with(Arc::new(StubTokenClient::default()), store);

    assert!(flow.clear().unwrap());
    assert!(!flow.status().unwrap().exists);
}
