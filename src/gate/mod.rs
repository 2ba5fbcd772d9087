//! Execution gate: the only path from an MCP client to the brokerage.
//!
//! For each action:
//! 1. Authenticate the caller's bearer token
//! 2. Look the action up in the catalog (effect comes from here, never from the caller)
//! 3. Mutating actions: fail fast on a missing or stale credential, then wait for approval
//! 4. Fetch a usable credential, refreshing the access token if near expiry
//! 5. Call the brokerage, retrying once after a refresh if the token is rejected
//!
//! Any failure before step 5 means the brokerage is never contacted.

mod brokerage;
mod catalog;


pub use brokerage::{BrokerageApi, BrokerageCallError, BrokerageResponse, HttpBrokerageApi};
pub use catalog::{default_action_catalog, ActionCatalog, ActionRoute, BrokerageCall, Effect, HttpMethod};

use crate::approval::{ActionDescriptor, ApprovalBackend};
use crate::auth::fingerprint;
use crate::broker::BrokerAuthFlow;
use crate::error::{GateError, GateResult};
use crate::oauth::{AuthorizationServer, Principal};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Approval that let a mutating action through
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub bypassed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: String,
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSummary>,
    #[serde(flatten)]
    pub response: BrokerageResponse,
}

pub struct ExecutionGate {
    oauth: Arc<AuthorizationServer>,
    broker: Arc<BrokerAuthFlow>,
    approval: Arc<dyn ApprovalBackend>,
    brokerage: Arc<dyn BrokerageApi>,
    catalog: ActionCatalog,
    approval_timeout: Duration,
}

impl ExecutionGate {
    pub fn new(
        oauth: Arc<AuthorizationServer>,
        broker: Arc<BrokerAuthFlow>,
        approval: Arc<dyn ApprovalBackend>,
        brokerage: Arc<dyn BrokerageApi>,
        catalog: ActionCatalog,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            oauth,
            broker,
            approval,
            brokerage,
            catalog,
            approval_timeout,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn approval_backend(&self) -> &'static str {
        self.approval.name()
    }

    /// Identity behind `bearer`, or `InvalidToken`.
    pub fn authenticate(&self, bearer: &str) -> GateResult<Principal> {
        self.oauth.introspect(bearer)?.ok_or_else(|| {
            debug!(token = %fingerprint(bearer), "Unknown or expired bearer");
            GateError::InvalidToken
        })
    }

    /// Run `action` on behalf of the holder of `bearer`.
    ///
    /// `cancel` aborts a pending approval wait (client went away).
    pub async fn execute(
        &self,
        bearer: &str,
        action: ActionDescriptor,
        cancel: CancellationToken,
    ) -> GateResult<ActionOutcome> {
        let principal = self.authenticate(bearer)?;

        let route = self.catalog.get(&action.name).ok_or_else(|| {
            GateError::InvalidRequest(format!("unknown action {}", action.name))
        })?;
        let call = route.build_call(&action.params)?;

        let approval = match route.effect {
            Effect::Read => None,
            Effect::Mutate => {
                self.broker.check_usable()?;

                let decision = self
                    .approval
                    .request(&action, &principal.client_id, self.approval_timeout, cancel)
                    .await?;

                info!(
                    action = %action.name,
                    client_id = %principal.client_id,
                    approval_id = ?decision.request_id,
                    bypassed = decision.bypassed,
                    "Mutating action approved"
                );

                Some(ApprovalSummary {
                    request_id: decision.request_id,
                    decided_by: decision.decided_by,
                    bypassed: decision.bypassed,
                })
            }
        };

        let response = self.call_brokerage(&call).await?;

        info!(
            action = %action.name,
            client_id = %principal.client_id,
            status = response.status,
            "Brokerage action completed"
        );

        Ok(ActionOutcome {
            action: action.name,
            effect: route.effect,
            approval,
            response,
        })
    }

    async fn call_brokerage(&self, call: &BrokerageCall) -> GateResult<BrokerageResponse> {
        let credential = self.broker.credential_for_use().await?;

        match self.brokerage.call(call, &credential.access_token).await {
            Ok(response) => Ok(response),
            Err(BrokerageCallError::Unauthorized) => {
                warn!(path = %call.path, "Brokerage rejected access token, refreshing once");
                let refreshed = self.broker.force_refresh(&credential.access_token).await?;
                self.brokerage
                    .call(call, &refreshed.access_token)
                    .await
                    .map_err(|e| GateError::Brokerage(e.to_string()))
            }
            Err(BrokerageCallError::Failed(e)) => Err(GateError::Brokerage(format!("{:#}", e))),
        }
    }
}
