//! Chat webhook approval channel (Discord-compatible payload).
//!
//! Action names and parameters come from the MCP client and are untrusted:
//! mentions are neutralised and parameters are shown inside a code block
//! that they cannot close.

use super::channel::ApprovalChannel;
use super::{ApprovalRequest, ApprovalStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;

const ZERO_WIDTH_SPACE: char = '\u{200b}';
/// Discord rejects message content longer than this
const MAX_CONTENT_CHARS: usize = 2000;

pub struct WebhookChannel {
    http: reqwest::Client,
    webhook_url: String,
    /// Base URL of this gateway, shown so approvers know where decisions go
    public_base_url: String,
}

/// Break `@everyone`, `@here`, user and role mentions.
fn neutralise_mentions(text: &str) -> String {
    text.replace('@', &format!("@{}", ZERO_WIDTH_SPACE))
}

/// Inline-code-safe single line
fn inline(text: &str) -> String {
    neutralise_mentions(&text.replace(['`', '\n', '\r'], " "))
}

/// Body of a fenced code block that cannot terminate the fence.
fn fenced(text: &str) -> String {
    neutralise_mentions(&text.replace("```", &format!("`{}``", ZERO_WIDTH_SPACE)))
}

fn truncate(mut text: String, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars.saturating_sub(1)).collect();
        text.push('…');
    }
    text
}

pub fn render_request(request: &ApprovalRequest, public_base_url: &str) -> String {
    let params = serde_json::to_string_pretty(&request.action.params)
        .unwrap_or_else(|_| request.action.params.to_string());
    let params = truncate(fenced(&params), 1200);

    format!(
        "**Approval required**: `{}` from client `{}`\n\
         Request `{}`, deadline {}\n\
         ```json\n{}\n```\n\
         Decide with a signed POST to {}/approvals/{}/decision",
        inline(&request.action.name),
        inline(&request.client_id),
        request.id,
        request.deadline.to_rfc3339(),
        params,
        public_base_url.trim_end_matches('/'),
        request.id,
    )
}

pub fn render_resolution(request: &ApprovalRequest) -> String {
    let outcome = match request.status {
        ApprovalStatus::Approved => "APPROVED",
        ApprovalStatus::Denied => "DENIED",
        ApprovalStatus::Expired => "EXPIRED",
        ApprovalStatus::Pending => "PENDING",
    };
    let by = request
        .decided_by
        .as_deref()
        .map(|who| format!(" by `{}`", inline(who)))
        .or_else(|| request.reason.as_deref().map(|r| format!(" ({})", inline(r))))
        .unwrap_or_default();

    format!(
        "Request `{}` for `{}`: **{}**{}",
        request.id,
        inline(&request.action.name),
        outcome,
        by
    )
}

impl WebhookChannel {
    pub fn new(webhook_url: String, public_base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            webhook_url,
            public_base_url,
        })
    }

    async fn post(&self, content: String) -> Result<()> {
        let body = json!({
            "content": truncate(content, MAX_CONTENT_CHARS),
            "allowed_mentions": { "parse": [] },
        });

        let response = self
            .http
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .context("Failed to send webhook message")?;

        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned status {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalChannel for WebhookChannel {
    async fn publish(&self, request: &ApprovalRequest) -> Result<()> {
        self.post(render_request(request, &self.public_base_url)).await
    }

    async fn resolved(&self, request: &ApprovalRequest) -> Result<()> {
        self.post(render_resolution(request)).await
    }
}
