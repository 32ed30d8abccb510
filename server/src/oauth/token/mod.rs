use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::errors::AuthError;
use crate::oauth::pkce;
use crate::state::IdpConfig;

/// Tokens held for a session. Owned by the backend and never sent to the browser.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    /// Absolute expiry, fixed when the token response was received
    pub expires_at: DateTime<Utc>,
}

/// Longest `expires_in` we accept from the token endpoint (one year)
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

impl TokenSet {
    /// Fix the absolute expiry at `received_at`. Lifetimes that are not positive, or that
    /// run past [`MAX_TOKEN_LIFETIME_SECS`], are rejected.
    pub fn from_response(
        response: TokenResponse,
        received_at: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&response.expires_in) {
            return Err(AuthError::ExchangeFailed(format!(
                "token lifetime out of range: {}",
                response.expires_in
            )));
        }
        let expires_at = received_at
            .checked_add_signed(Duration::seconds(response.expires_in))
            .ok_or_else(|| AuthError::ExchangeFailed("token expiry overflows".to_string()))?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
}

/// Error body returned by the token endpoint (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// What the callback handler hands to the exchange.
///
/// Not `Clone`. Exchanging consumes it, so a code is presented at most once.
pub struct ExchangeRequest {
    pub code: String,
    pub verifier: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for ExchangeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeRequest")
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct AuthorizationCodeGrant<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    code_verifier: &'a str,
    redirect_uri: &'a str,
}

#[derive(Serialize)]
struct RefreshTokenGrant<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
}

/// Exchange an authorization code and PKCE verifier for tokens.
///
/// One attempt only. A failed or timed-out call is reported as `ExchangeFailed`; the
/// code has been spent either way.
#[instrument(skip_all, fields(token_endpoint = %config.token_endpoint()))]
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &IdpConfig,
    request: ExchangeRequest,
) -> Result<TokenSet, AuthError> {
    let ExchangeRequest {
        code,
        verifier,
        redirect_uri,
    } = request;

    if code.is_empty() {
        return Err(AuthError::ExchangeFailed(
            "empty authorization code".to_string(),
        ));
    }
    if !pkce::is_valid_verifier(&verifier) {
        return Err(AuthError::ExchangeFailed(
            "malformed code verifier".to_string(),
        ));
    }

    let grant = AuthorizationCodeGrant {
        grant_type: "authorization_code",
        client_id: &config.client_id,
        client_secret: config.client_secret.value(),
        code: &code,
        code_verifier: &verifier,
        redirect_uri: &redirect_uri,
    };

    let token_set = post_token_request(http, config, &grant).await?;
    info!(expires_at = %token_set.expires_at, "Authorization code exchanged");
    Ok(token_set)
}

/// Use a refresh token to obtain a new token set
#[instrument(skip_all, fields(token_endpoint = %config.token_endpoint()))]
pub async fn refresh_tokens(
    http: &reqwest::Client,
    config: &IdpConfig,
    refresh_token: &str,
) -> Result<TokenSet, AuthError> {
    let grant = RefreshTokenGrant {
        grant_type: "refresh_token",
        client_id: &config.client_id,
        client_secret: config.client_secret.value(),
        refresh_token,
    };

    let mut token_set = post_token_request(http, config, &grant).await?;
    // Providers that do not rotate refresh tokens omit it from the response
    if token_set.refresh_token.is_none() {
        token_set.refresh_token = Some(refresh_token.to_string());
    }

    info!(expires_at = %token_set.expires_at, "Tokens refreshed");
    Ok(token_set)
}

async fn post_token_request<T: Serialize>(
    http: &reqwest::Client,
    config: &IdpConfig,
    grant: &T,
) -> Result<TokenSet, AuthError> {
    let response = http
        .post(config.token_endpoint())
        .form(grant)
        .send()
        .await
        .map_err(|e| {
            let reason = if e.is_timeout() {
                "token endpoint timed out".to_string()
            } else {
                format!("token endpoint unreachable: {e}")
            };
            warn!("{}", reason);
            AuthError::ExchangeFailed(reason)
        })?;

    let status = response.status();
    let received_at = Utc::now();
    let body = response
        .text()
        .await
        .map_err(|e| AuthError::ExchangeFailed(format!("failed to read token response: {e}")))?;

    if !status.is_success() {
        let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => format!(
                "HTTP {}: {}{}",
                status,
                err.error,
                err.error_description
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            ),
            Err(_) => format!("HTTP {status}"),
        };
        warn!("Token endpoint rejected the request: {}", reason);
        return Err(AuthError::ExchangeFailed(reason));
    }

    let token_response: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| AuthError::ExchangeFailed(format!("malformed token response: {e}")))?;

    if token_response.access_token.is_empty() {
        return Err(AuthError::ExchangeFailed(
            "token response is missing an access token".to_string(),
        ));
    }

    TokenSet::from_response(token_response, received_at)
}
