//! OAuth 2.1 endpoints for MCP clients.
//!
//! - GET  /.well-known/oauth-authorization-server (RFC 8414)
//! - GET  /.well-known/oauth-protected-resource (RFC 9728)
//! - POST /register (RFC 7591)
//! - GET  /authorize → 302 to the consent page
//! - GET  /consent, POST /consent
//! - POST /token (authorization_code, refresh_token)
//! - POST /revoke (RFC 7009)
//! - POST /introspect (RFC 7662)

use super::pages::{consent_page, with_page_headers, PageError};
use crate::auth::extract_bearer_token;
use crate::error::{GateError, GateResult};
use crate::oauth::{AuthorizationRequest, AuthorizationServer, ClientAuth, ClientMetadata};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared application state for the OAuth endpoints
#[derive(Clone)]
pub struct OAuthAppState {
    pub server: Arc<AuthorizationServer>,
    /// Public base URL, used as issuer and to build endpoint URLs
    pub base_url: String,
}

impl OAuthAppState {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub fn create_oauth_router(state: OAuthAppState) -> Router {
    let state = Arc::new(state);

    let pages = with_page_headers(
        Router::new()
            .route("/consent", get(consent_get).post(consent_post))
            .with_state(state.clone()),
    );

    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route("/register", post(register))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/revoke", post(revoke))
        .route("/introspect", post(introspect))
        .with_state(state)
        .merge(pages)
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Token responses must never be cached (RFC 6749 §5.1)
fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
    response
}

async fn authorization_server_metadata(State(state): State<Arc<OAuthAppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "issuer": state.base_url.trim_end_matches('/'),
        "authorization_endpoint": state.endpoint("/authorize"),
        "token_endpoint": state.endpoint("/token"),
        "registration_endpoint": state.endpoint("/register"),
        "revocation_endpoint": state.endpoint("/revoke"),
        "introspection_endpoint": state.endpoint("/introspect"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none", "client_secret_post"],
        "scopes_supported": state.server.config().scopes,
    }))
}

async fn protected_resource_metadata(State(state): State<Arc<OAuthAppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "resource": state.base_url.trim_end_matches('/'),
        "authorization_servers": [state.base_url.trim_end_matches('/')],
        "scopes_supported": state.server.config().scopes,
        "bearer_methods_supported": ["header"],
    }))
}

/// RFC 7591 registration response
#[derive(Serialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    client_id_issued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_name: Option<String>,
    redirect_uris: Vec<String>,
    token_endpoint_auth_method: &'static str,
    grant_types: [&'static str; 2],
    response_types: [&'static str; 1],
}

/// POST /register
async fn register(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    body: Result<Json<ClientMetadata>, JsonRejection>,
) -> GateResult<Response> {
    let presented = extract_bearer_token(&headers).ok();
    state.server.check_registration_token(presented.as_deref())?;

    let Json(metadata) =
        body.map_err(|e| GateError::InvalidRequest(format!("registration body: {}", e)))?;
    let registered = state.server.register_client(metadata)?;
    let client = registered.client;

    let response = RegistrationResponse {
        token_endpoint_auth_method: client.auth_method(),
        client_id: client.client_id,
        client_secret: registered.client_secret,
        client_id_issued_at: client.registered_at.timestamp(),
        client_name: client.client_name,
        redirect_uris: client.redirect_uris,
        grant_types: ["authorization_code", "refresh_token"],
        response_types: ["code"],
    };

    Ok(no_store((StatusCode::CREATED, Json(response)).into_response()))
}

/// GET /authorize
async fn authorize(
    State(state): State<Arc<OAuthAppState>>,
    Query(request): Query<AuthorizationRequest>,
) -> GateResult<Response> {
    let pending = state.server.authorize(request)?;
    let location = format!(
        "{}?state={}",
        state.endpoint("/consent"),
        urlencoding::encode(&pending.state)
    );
    Ok(found(location))
}

#[derive(Deserialize)]
struct ConsentQuery {
    #[serde(default)]
    state: String,
}

/// GET /consent?state=
async fn consent_get(
    State(state): State<Arc<OAuthAppState>>,
    Query(query): Query<ConsentQuery>,
) -> Result<Html<String>, PageError> {
    if query.state.is_empty() {
        return Err(GateError::InvalidRequest("missing state".to_string()).into());
    }
    let view = state.server.render_consent(&query.state)?;
    Ok(Html(consent_page(&view)))
}

#[derive(Deserialize)]
struct ConsentForm {
    #[serde(default)]
    state: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    password: Option<String>,
}

/// POST /consent
async fn consent_post(
    State(state): State<Arc<OAuthAppState>>,
    Form(form): Form<ConsentForm>,
) -> Result<Response, PageError> {
    let location = match form.action.as_str() {
        "approve" => {
            state
                .server
                .approve_consent(&form.state, form.password.as_deref())?
                .redirect_to
        }
        "deny" => state.server.deny_consent(&form.state)?,
        other => {
            return Err(GateError::InvalidRequest(format!("unknown consent action {:?}", other)).into())
        }
    };
    Ok(found(location))
}

#[derive(Deserialize)]
struct TokenRequest {
    #[serde(default)]
    grant_type: String,
    code: Option<String>,
    code_verifier: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> GateResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GateError::InvalidRequest(format!("missing {}", name)))
}

/// POST /token
async fn token(State(state): State<Arc<OAuthAppState>>, Form(request): Form<TokenRequest>) -> Response {
    let auth = ClientAuth {
        client_id: request.client_id.as_deref(),
        client_secret: request.client_secret.as_deref(),
    };

    let result = match request.grant_type.as_str() {
        "authorization_code" => required(&request.code, "code").and_then(|code| {
            let verifier = required(&request.code_verifier, "code_verifier")?;
            state
                .server
                .exchange_code(code, verifier, request.redirect_uri.as_deref(), auth)
        }),
        "refresh_token" => required(&request.refresh_token, "refresh_token")
            .and_then(|refresh| state.server.refresh(refresh, auth)),
        other => {
            debug!(grant_type = %other, "Unsupported grant type");
            return no_store(
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "unsupported_grant_type",
                        "error_description": "Only authorization_code and refresh_token are supported",
                    })),
                )
                    .into_response(),
            );
        }
    };

    match result {
        Ok(pair) => {
            info!(grant_type = %request.grant_type, "Token issued");
            no_store(Json(pair).into_response())
        }
        Err(e) => no_store(e.into_response()),
    }
}

#[derive(Deserialize)]
struct TokenForm {
    #[serde(default)]
    token: String,
}

/// POST /revoke. Unknown tokens are not an error (RFC 7009 §2.2).
async fn revoke(
    State(state): State<Arc<OAuthAppState>>,
    Form(form): Form<TokenForm>,
) -> GateResult<StatusCode> {
    if form.token.is_empty() {
        return Err(GateError::InvalidRequest("missing token".to_string()));
    }
    state.server.revoke(&form.token)?;
    Ok(StatusCode::OK)
}

/// POST /introspect
async fn introspect(
    State(state): State<Arc<OAuthAppState>>,
    Form(form): Form<TokenForm>,
) -> GateResult<Response> {
    let body = match state.server.introspect(&form.token)? {
        Some(principal) => json!({
            "active": true,
            "client_id": principal.client_id,
            "scope": principal.scope,
            "exp": principal.expires_at.timestamp(),
            "token_type": "Bearer",
        }),
        None => json!({ "active": false }),
    };
    Ok(no_store(Json(body).into_response()))
}
