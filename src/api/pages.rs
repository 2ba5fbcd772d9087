//! Server-rendered HTML for the browser-facing flows (consent, brokerage callback).
//!
//! Every interpolated value goes through [`html_escape`].

use crate::error::GateError;
use crate::oauth::ConsentView;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; style-src 'unsafe-inline'; base-uri 'none'; frame-ancestors 'none'";

pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Security headers for every page route
pub fn with_page_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 480px; margin: 40px auto; padding: 20px; background: #f5f5f5; }}
.card {{ background: white; border-radius: 12px; padding: 32px; box-shadow: 0 2px 8px rgba(0,0,0,0.1); }}
h1 {{ font-size: 1.4em; margin-top: 0; }}
p, dd {{ color: #555; line-height: 1.5; }}
code {{ word-break: break-all; }}
.actions {{ display: flex; gap: 12px; margin-top: 24px; }}
button {{ flex: 1; padding: 12px 24px; border: none; border-radius: 8px; font-size: 1em; cursor: pointer; }}
.approve {{ background: #2563eb; color: white; }}
.deny {{ background: #e5e7eb; color: #374151; }}
input[type=password] {{ width: 100%; padding: 8px; box-sizing: border-box; }}
</style>
</head>
<body>
<div class="card">
{body}
</div>
</body>
</html>"#,
        title = html_escape(title),
        body = body
    )
}

pub fn consent_page(view: &ConsentView) -> String {
    let name = view.client_name.as_deref().unwrap_or("An MCP client");
    let password = if view.requires_password {
        r#"<p><label for="password">Consent password</label><br>
<input type="password" id="password" name="password" autocomplete="current-password" required></p>"#
    } else {
        ""
    };

    let body = format!(
        r#"<h1>Authorize {name}</h1>
<p><strong>{name}</strong> is requesting access to this brokerage gateway.
Mutating actions still require separate human approval.</p>
<dl>
<dt>Client ID</dt><dd><code>{client_id}</code></dd>
<dt>Redirect URI</dt><dd><code>{redirect_uri}</code></dd>
<dt>Scope</dt><dd><code>{scope}</code></dd>
</dl>
<form action="/consent" method="post">
<input type="hidden" name="state" value="{state}">
{password}
<div class="actions">
<button type="submit" name="action" value="approve" class="approve">Approve</button>
<button type="submit" name="action" value="deny" class="deny" formnovalidate>Deny</button>
</div>
</form>"#,
        name = html_escape(name),
        client_id = html_escape(&view.client_id),
        redirect_uri = html_escape(&view.redirect_uri),
        scope = html_escape(&view.scope),
        state = html_escape(&view.state),
        password = password,
    );

    layout("Authorize client", &body)
}

pub fn message_page(title: &str, message: &str) -> String {
    layout(
        title,
        &format!(
            "<h1>{}</h1>\n<p>{}</p>",
            html_escape(title),
            html_escape(message)
        ),
    )
}

/// A [`GateError`] rendered as an HTML page with only the public description.
pub struct PageError(pub GateError);

impl From<GateError> for PageError {
    fn from(err: GateError) -> Self {
        PageError(err)
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let (status, _, description) = self.0.public_parts();

        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "Page request failed");
        } else {
            tracing::warn!(error = %self.0, status = %status, "Page request rejected");
        }

        let title = if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            "Not authorized"
        } else {
            "Request failed"
        };
        (status, Html(message_page(title, description))).into_response()
    }
}
