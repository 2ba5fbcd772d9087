//! Brokerage trading API client.

use super::catalog::BrokerageCall;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerageResponse {
    pub status: u16,
    pub body: Value,
    /// `Location` header, which carries the new order URL on order placement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerageCallError {
    /// The access token was rejected; a refresh may help
    #[error("brokerage rejected the access token")]
    Unauthorized,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[async_trait]
pub trait BrokerageApi: Send + Sync {
    async fn call(
        &self,
        call: &BrokerageCall,
        access_token: &str,
    ) -> Result<BrokerageResponse, BrokerageCallError>;
}

pub struct HttpBrokerageApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBrokerageApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BrokerageApi for HttpBrokerageApi {
    async fn call(
        &self,
        call: &BrokerageCall,
        access_token: &str,
    ) -> Result<BrokerageResponse, BrokerageCallError> {
        let url = format!("{}{}", self.base_url, call.path);
        debug!(method = ?call.method, path = %call.path, "Calling brokerage API");

        let mut request = self
            .http
            .request(call.method.as_reqwest(), &url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach brokerage API")?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BrokerageCallError::Unauthorized);
        }
        if !status.is_success() {
            return Err(anyhow!("Brokerage API returned status {}", status).into());
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .context("Failed to read brokerage response")?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(BrokerageResponse {
            status: status.as_u16(),
            body,
            location,
        })
    }
}
