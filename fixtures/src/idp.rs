//! Fixture identity provider.
//!
//! Speaks the Auth0-shaped subset of OAuth2/OIDC the backend relies on: an authorize
//! endpoint that logs the fixture user in immediately, a token endpoint enforcing PKCE
//! S256 and single-use codes, a JWKS document, and an end-session redirect.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::signing::SigningKey;

/// The user every fixture login resolves to
#[derive(Debug, Clone, Serialize)]
pub struct FixtureUser {
    pub sub: String,
    pub name: String,
    pub nickname: String,
    pub email: String,
}

impl Default for FixtureUser {
    fn default() -> Self {
        Self {
            sub: "auth0|fixture-user".to_string(),
            name: "Fixture User".to_string(),
            nickname: "fixture-user".to_string(),
            email: "fixture-user@example.test".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdpSettings {
    pub client_id: String,
    pub client_secret: String,
    pub audience: Option<String>,
    /// Lifetime of issued access and ID tokens
    pub token_ttl_secs: u64,
    pub user: FixtureUser,
}

impl Default for IdpSettings {
    fn default() -> Self {
        Self {
            client_id: "fixture-client".to_string(),
            client_secret: "fixture-secret".to_string(),
            audience: Some("https://weather.api.test".to_string()),
            token_ttl_secs: 3600,
            user: FixtureUser::default(),
        }
    }
}

struct IssuedCode {
    redirect_uri: String,
    code_challenge: String,
    audience: Option<String>,
    scope: String,
}

struct IssuedRefresh {
    audience: Option<String>,
    scope: String,
}

#[derive(Clone)]
pub struct IdpState {
    issuer: String,
    settings: Arc<IdpSettings>,
    key: Arc<SigningKey>,
    codes: Arc<Mutex<HashMap<String, IssuedCode>>>,
    refresh_tokens: Arc<Mutex<HashMap<String, IssuedRefresh>>>,
}

impl IdpState {
    pub fn new(issuer: impl Into<String>, settings: IdpSettings) -> Self {
        Self {
            issuer: issuer.into(),
            settings: Arc::new(settings),
            key: Arc::new(SigningKey::generate("fixture-key-1")),
            codes: Arc::new(Mutex::new(HashMap::new())),
            refresh_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Mint an access token for `sub` outside of any login, for bearer-token tests
    pub fn access_token_for(&self, sub: &str) -> anyhow::Result<String> {
        let audience = self
            .settings
            .audience
            .clone()
            .unwrap_or_else(|| self.settings.client_id.clone());
        let now = now_secs();
        self.key.sign(&json!({
            "iss": self.issuer,
            "sub": sub,
            "aud": audience,
            "iat": now,
            "exp": now + self.settings.token_ttl_secs,
            "scope": "read:weather",
        }))
    }

    fn issue_tokens(&self, audience: Option<String>, scope: String) -> anyhow::Result<Response> {
        let settings = &self.settings;
        let now = now_secs();
        let exp = now + settings.token_ttl_secs;

        let access_token = self.key.sign(&json!({
            "iss": self.issuer,
            "sub": settings.user.sub,
            "aud": audience.clone().unwrap_or_else(|| settings.client_id.clone()),
            "iat": now,
            "exp": exp,
            "scope": scope,
        }))?;

        let id_token = self.key.sign(&json!({
            "iss": self.issuer,
            "sub": settings.user.sub,
            "aud": settings.client_id,
            "iat": now,
            "exp": exp,
            "name": settings.user.name,
            "nickname": settings.user.nickname,
            "email": settings.user.email,
        }))?;

        let refresh_token = Uuid::new_v4().simple().to_string();
        self.refresh_tokens.lock().unwrap().insert(
            refresh_token.clone(),
            IssuedRefresh {
                audience,
                scope: scope.clone(),
            },
        );

        Ok(Json(json!({
            "access_token": access_token,
            "id_token": id_token,
            "refresh_token": refresh_token,
            "token_type": "Bearer",
            "expires_in": settings.token_ttl_secs,
            "scope": scope,
        }))
        .into_response())
    }
}

/// A fixture IdP listening on an ephemeral localhost port
pub struct FixtureIdp {
    state: IdpState,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FixtureIdp {
    pub async fn start(settings: IdpSettings) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = IdpState::new(format!("http://{addr}/"), settings);
        let app = router(state.clone());

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!("Fixture IdP stopped: {:?}", err);
            }
        });

        info!("Fixture IdP listening on {}", addr);
        Ok(Self {
            state,
            addr,
            handle,
        })
    }

    /// Issuer URL, with the trailing slash Auth0 uses
    pub fn issuer(&self) -> &str {
        self.state.issuer()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &IdpState {
        &self.state
    }

    pub fn settings(&self) -> &IdpSettings {
        &self.state.settings
    }
}

impl Drop for FixtureIdp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn router(state: IdpState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .route("/v2/logout", get(logout))
        .with_state(state)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

fn endpoint(state: &IdpState, path: &str) -> String {
    format!("{}/{}", state.issuer.trim_end_matches('/'), path)
}

async fn openid_configuration(State(state): State<IdpState>) -> impl IntoResponse {
    Json(json!({
        "issuer": state.issuer,
        "authorization_endpoint": endpoint(&state, "authorize"),
        "token_endpoint": endpoint(&state, "oauth/token"),
        "jwks_uri": endpoint(&state, ".well-known/jwks.json"),
        "end_session_endpoint": endpoint(&state, "v2/logout"),
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
        "id_token_signing_alg_values_supported": ["ES256"],
    }))
}

async fn jwks(State(state): State<IdpState>) -> impl IntoResponse {
    Json(state.key.jwks())
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    scope: Option<String>,
    audience: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

#[derive(Serialize)]
struct OAuthRedirectParams<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
}

async fn authorize(
    State(state): State<IdpState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.client_id != state.settings.client_id {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unauthorized_client",
            "Unknown client_id",
        );
    }
    if params.response_type != "code" {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_response_type",
            "Only the code response type is supported",
        );
    }
    let Some(code_challenge) = params.code_challenge else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge is required",
        );
    };
    if params.code_challenge_method.as_deref() != Some("S256") {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge_method must be S256",
        );
    }

    let code = Uuid::new_v4().simple().to_string();
    state.codes.lock().unwrap().insert(
        code.clone(),
        IssuedCode {
            redirect_uri: params.redirect_uri.clone(),
            code_challenge,
            audience: params.audience.or_else(|| state.settings.audience.clone()),
            scope: params.scope.unwrap_or_else(|| "openid".to_string()),
        },
    );

    let query = match serde_urlencoded::to_string(OAuthRedirectParams {
        code: &code,
        state: params.state.as_deref(),
    }) {
        Ok(query) => query,
        Err(err) => {
            return oauth_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                &err.to_string(),
            )
        }
    };
    let separator = if params.redirect_uri.contains('?') {
        '&'
    } else {
        '?'
    };

    info!("Fixture IdP: issuing code for {}", state.settings.user.sub);
    Redirect::to(&format!("{}{}{}", params.redirect_uri, separator, query)).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    code: Option<String>,
    code_verifier: Option<String>,
    redirect_uri: Option<String>,
    refresh_token: Option<String>,
}

async fn token(State(state): State<IdpState>, Form(params): Form<TokenParams>) -> Response {
    if params.client_id.as_deref() != Some(state.settings.client_id.as_str())
        || params.client_secret.as_deref() != Some(state.settings.client_secret.as_str())
    {
        return oauth_error(
            StatusCode::UNAUTHORIZED,
            "invalid_client",
            "Client authentication failed",
        );
    }

    let issued = match params.grant_type.as_str() {
        "authorization_code" => {
            // Codes are burned on first presentation, whatever happens next
            let Some(issued) = params
                .code
                .as_deref()
                .and_then(|code| state.codes.lock().unwrap().remove(code))
            else {
                return oauth_error(
                    StatusCode::FORBIDDEN,
                    "invalid_grant",
                    "Invalid authorization code",
                );
            };

            if params.redirect_uri.as_deref() != Some(issued.redirect_uri.as_str()) {
                return oauth_error(
                    StatusCode::FORBIDDEN,
                    "invalid_grant",
                    "redirect_uri does not match the authorization request",
                );
            }

            let verifier = params.code_verifier.unwrap_or_default();
            let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            if challenge != issued.code_challenge {
                return oauth_error(
                    StatusCode::FORBIDDEN,
                    "invalid_grant",
                    "Failed to verify code verifier",
                );
            }

            IssuedRefresh {
                audience: issued.audience,
                scope: issued.scope,
            }
        }
        "refresh_token" => {
            let Some(issued) = params
                .refresh_token
                .as_deref()
                .and_then(|token| state.refresh_tokens.lock().unwrap().remove(token))
            else {
                return oauth_error(
                    StatusCode::FORBIDDEN,
                    "invalid_grant",
                    "Unknown or invalid refresh token",
                );
            };
            issued
        }
        other => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                &format!("Unsupported grant type: {other}"),
            )
        }
    };

    match state.issue_tokens(issued.audience, issued.scope) {
        Ok(response) => response,
        Err(err) => oauth_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            &err.to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct LogoutParams {
    client_id: Option<String>,
    #[serde(rename = "returnTo")]
    return_to: Option<String>,
}

async fn logout(State(state): State<IdpState>, Query(params): Query<LogoutParams>) -> Response {
    if params.client_id.as_deref() != Some(state.settings.client_id.as_str()) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "Unknown client_id");
    }

    match params.return_to {
        Some(return_to) => Redirect::to(&return_to).into_response(),
        None => (StatusCode::OK, "Logged out").into_response(),
    }
}
