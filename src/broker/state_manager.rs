//! CSRF state tracking for the brokerage authorization redirect.
//!
//! States are single-use, expire after a fixed TTL and are capped in number.
//! Lookups are by exact value only.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::auth::random_urlsafe;

/// What a pending state was issued for
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerAuthContext {
    /// Operator (or subsystem) that started the flow, for the audit log
    pub initiated_by: String,
    /// Redirect URI sent with the authorize request; the exchange must repeat it
    pub redirect_uri: String,
}

#[derive(Clone, Debug)]
pub struct StateEntry {
    pub context: BrokerAuthContext,
    pub created_at: DateTime<Utc>,
}

/// Bounded, expiring map of `state -> context`
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
    max_entries: usize,
}

impl StateManager {
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid
    /// * `max_entries` - Ceiling on outstanding states; the oldest is evicted beyond it
    pub fn new(expiry_seconds: i64, max_entries: usize) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
            max_entries: max_entries.max(1),
        }
    }

    /// Generate a new random state bound to `context`
    pub fn create_state(&self, context: BrokerAuthContext) -> String {
        let state = random_urlsafe(32);
        let now = Utc::now();

        let mut states = self.states.lock().expect("state map lock poisoned");
        states.retain(|_, entry| now - entry.created_at <= self.expiry_duration);

        while states.len() >= self.max_entries {
            let oldest = states
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    states.remove(&key);
                    tracing::debug!("Evicted oldest pending brokerage auth state");
                }
                None => break,
            }
        }

        states.insert(
            state.clone(),
            StateEntry {
                context,
                created_at: now,
            },
        );

        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the entry only for an exact, unexpired match. The state is
    /// removed either way (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let mut states = self.states.lock().expect("state map lock poisoned");

        let entry = states.remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Drop expired states
    pub fn cleanup_expired(&self) {
        let mut states = self.states.lock().expect("state map lock poisoned");
        let now = Utc::now();

        states.retain(|_, entry| now - entry.created_at <= self.expiry_duration);
    }

    pub fn count(&self) -> usize {
        self.states.lock().expect("state map lock poisoned").len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(
            remaining = manager.count(),
            "Brokerage auth state cleanup complete"
        );
    }
}
