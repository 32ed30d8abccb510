//! The login round trip: authorize redirect, callback validation, code exchange.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::AuthError;
use crate::oauth::jwk::{Claims, TokenVerifier};
use crate::oauth::pending::{PendingAuthorization, PendingStore};
use crate::oauth::pkce::{self, Pkce, CHALLENGE_METHOD};
use crate::oauth::token::{self, ExchangeRequest, TokenSet};
use crate::state::IdpConfig;

/// Query parameters of the IdP authorize URL
#[derive(Serialize)]
struct AuthorizeParams<'a> {
    response_type: &'static str,
    client_id: &'a str,
    redirect_uri: &'a str,
    scope: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<&'a str>,
    state: &'a str,
    code_challenge: &'a str,
    code_challenge_method: &'static str,
}

#[derive(Serialize)]
struct LogoutParams<'a> {
    client_id: &'a str,
    #[serde(rename = "returnTo")]
    return_to: &'a str,
}

/// Where to send the browser to start a login
#[derive(Debug)]
pub struct LoginRedirect {
    pub url: String,
    pub state: String,
}

/// What comes back from the IdP, either on the callback query string or posted by a
/// script-driven client.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Only sent by script-driven clients; must equal the registered callback if present
    pub redirect_uri: Option<String>,
}

/// A callback whose `state` matched a pending login. The pending entry is already gone.
#[derive(Debug)]
pub struct VerifiedCallback {
    pub exchange: ExchangeRequest,
    pub return_to: String,
}

/// Drives the Authorization Code + PKCE flow against the configured IdP
#[derive(Clone)]
pub struct OAuthFlow {
    config: Arc<IdpConfig>,
    pending: PendingStore,
    http: reqwest::Client,
    verifier: TokenVerifier,
}

impl OAuthFlow {
    pub fn new(config: Arc<IdpConfig>, http: reqwest::Client, verifier: TokenVerifier) -> Self {
        Self {
            config,
            pending: PendingStore::new(),
            http,
            verifier,
        }
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Create a pending login and build the authorize URL for it
    #[instrument(skip(self))]
    pub fn begin_login(&self, return_to: Option<&str>) -> Result<LoginRedirect, AuthError> {
        let pkce = Pkce::generate();
        let state = pkce::generate_state();

        let params = AuthorizeParams {
            response_type: "code",
            client_id: &self.config.client_id,
            redirect_uri: &self.config.redirect_uri,
            scope: &self.config.scope,
            audience: self.config.audience.as_deref(),
            state: &state,
            code_challenge: &pkce.challenge,
            code_challenge_method: CHALLENGE_METHOD,
        };
        let query = serde_urlencoded::to_string(&params).map_err(|e| {
            AuthError::Configuration(format!("failed to encode authorize parameters: {e}"))
        })?;
        let url = format!("{}?{}", self.config.authorize_endpoint(), query);

        self.pending.insert(PendingAuthorization {
            state: state.clone(),
            verifier: pkce.verifier,
            challenge: pkce.challenge,
            redirect_uri: self.config.redirect_uri.clone(),
            return_to: sanitize_return_to(return_to),
            created_at: Utc::now(),
        });

        debug!(pending = self.pending.len(), "Login started");
        Ok(LoginRedirect { url, state })
    }

    /// Match the callback to its pending login.
    ///
    /// The pending entry is consumed before anything else is checked, so a `state` value
    /// is spent even when the callback turns out to be an error.
    #[instrument(skip_all)]
    pub fn handle_callback(&self, params: CallbackParams) -> Result<VerifiedCallback, AuthError> {
        let state = params
            .state
            .filter(|state| !state.is_empty())
            .ok_or(AuthError::StateNotFound)?;

        let pending = self.pending.take(&state).ok_or_else(|| {
            warn!("Callback state did not match a pending login");
            AuthError::StateNotFound
        })?;

        if let Some(error) = params.error {
            return Err(AuthError::AuthorizationDenied {
                error,
                description: params.error_description,
            });
        }

        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AuthError::ExchangeFailed("callback carried no code".to_string()))?;

        if let Some(redirect_uri) = params.redirect_uri {
            if redirect_uri != pending.redirect_uri {
                return Err(AuthError::ExchangeFailed(
                    "redirect_uri does not match the one used at authorize".to_string(),
                ));
            }
        }

        Ok(VerifiedCallback {
            exchange: ExchangeRequest {
                code,
                verifier: pending.verifier,
                redirect_uri: pending.redirect_uri,
            },
            return_to: pending.return_to,
        })
    }

    pub async fn exchange(&self, request: ExchangeRequest) -> Result<TokenSet, AuthError> {
        token::exchange_code(&self.http, &self.config, request).await
    }

    /// Exchange the code and verify the returned ID token.
    ///
    /// Nothing is stored here; the caller creates a session only from a successful result.
    pub async fn finish_login(
        &self,
        request: ExchangeRequest,
    ) -> Result<(TokenSet, Claims), AuthError> {
        let token_set = self.exchange(request).await?;
        let claims = self.verify_identity(&token_set).await?;
        info!(sub = %claims.sub, "Login completed");
        Ok((token_set, claims))
    }

    /// Verify the ID token in `token_set` and return its claims
    pub async fn verify_identity(&self, token_set: &TokenSet) -> Result<Claims, AuthError> {
        let id_token = token_set.id_token.as_deref().ok_or_else(|| {
            AuthError::ExchangeFailed("token response has no id_token".to_string())
        })?;

        self.verifier
            .verify(id_token, &self.config.client_id)
            .await
            .map_err(|e| match e {
                AuthError::Unauthorized(reason) | AuthError::KeysUnavailable(reason) => {
                    AuthError::ExchangeFailed(format!("id_token rejected: {reason}"))
                }
                other => other,
            })
    }

    /// Trade a refresh token for a new token set. Claims are returned when the IdP
    /// issued a new ID token.
    pub async fn refresh(
        &self,
        refresh_token: &str,
    ) -> Result<(TokenSet, Option<Claims>), AuthError> {
        let token_set = token::refresh_tokens(&self.http, &self.config, refresh_token).await?;
        let claims = match token_set.id_token {
            Some(_) => Some(self.verify_identity(&token_set).await?),
            None => None,
        };
        Ok((token_set, claims))
    }

    /// `{issuer}/v2/logout?client_id=..&returnTo=..`
    pub fn logout_url(&self) -> Result<String, AuthError> {
        let query = serde_urlencoded::to_string(LogoutParams {
            client_id: &self.config.client_id,
            return_to: &self.config.post_logout_redirect_uri,
        })
        .map_err(|e| AuthError::Configuration(format!("failed to encode logout URL: {e}")))?;

        Ok(format!("{}?{}", self.config.end_session_endpoint(), query))
    }
}

/// Accept only same-origin absolute paths; everything else lands on `/`
pub fn sanitize_return_to(return_to: Option<&str>) -> String {
    match return_to {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::jwk::JwksCache;
    use crate::state::ClientSecret;
    use std::collections::HashMap;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(issuer: &str) -> IdpConfig {
        IdpConfig {
            issuer: issuer.to_string(),
            client_id: "client-123".to_string(),
            client_secret: ClientSecret::new("s3cret"),
            audience: Some("https://api.test".to_string()),
            scope: "openid profile".to_string(),
            redirect_uri: "https://app.test/callback".to_string(),
            post_logout_redirect_uri: "https://app.test/".to_string(),
            http_timeout: Duration::from_secs(2),
        }
    }

    fn flow(issuer: &str) -> OAuthFlow {
        let config = Arc::new(config(issuer));
        let http = reqwest::Client::new();
        let jwks = JwksCache::new(config.jwks_uri(), http.clone());
        let verifier = TokenVerifier::new(jwks, config.issuer.clone());
        OAuthFlow::new(config, http, verifier)
    }

    fn query_of(url: &str) -> HashMap<String, String> {
        let (_, query) = url.split_once('?').unwrap();
        serde_urlencoded::from_str(query).unwrap()
    }

    fn callback(code: &str, state: &str) -> CallbackParams {
        CallbackParams {
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_authorize_url_carries_pkce_and_state() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();

        assert!(redirect.url.starts_with("https://idp.test/authorize?"));
        let query = query_of(&redirect.url);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["redirect_uri"], "https://app.test/callback");
        assert_eq!(query["scope"], "openid profile");
        assert_eq!(query["audience"], "https://api.test");
        assert_eq!(query["state"], redirect.state);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"].len(), 43);
        assert_eq!(flow.pending().len(), 1);
    }

    #[test]
    fn test_verifier_never_appears_in_url() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();
        let verified = flow
            .handle_callback(callback("code", &redirect.state))
            .unwrap();

        assert!(!redirect.url.contains(&verified.exchange.verifier));
        assert_eq!(
            query_of(&redirect.url)["code_challenge"],
            pkce::derive_challenge(&verified.exchange.verifier)
        );
    }

    #[test]
    fn test_audience_is_omitted_when_unset() {
        let mut config = config("https://idp.test/");
        config.audience = None;
        let config = Arc::new(config);
        let http = reqwest::Client::new();
        let verifier = TokenVerifier::new(
            JwksCache::new(config.jwks_uri(), http.clone()),
            config.issuer.clone(),
        );
        let flow = OAuthFlow::new(config, http, verifier);

        let redirect = flow.begin_login(None).unwrap();
        assert!(!query_of(&redirect.url).contains_key("audience"));
    }

    #[test]
    fn test_sequential_logins_never_share_state_or_verifier() {
        let flow = flow("https://idp.test/");
        let first = flow.begin_login(None).unwrap();
        let second = flow.begin_login(None).unwrap();
        assert_ne!(first.state, second.state);

        let a = flow.handle_callback(callback("c", &first.state)).unwrap();
        let b = flow.handle_callback(callback("c", &second.state)).unwrap();
        assert_ne!(a.exchange.verifier, b.exchange.verifier);
    }

    #[test]
    fn test_callback_returns_stored_verifier_and_return_to() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(Some("/forecast?city=Oslo")).unwrap();

        let verified = flow
            .handle_callback(callback("the-code", &redirect.state))
            .unwrap();
        assert_eq!(verified.exchange.code, "the-code");
        assert_eq!(verified.exchange.redirect_uri, "https://app.test/callback");
        assert!(pkce::is_valid_verifier(&verified.exchange.verifier));
        assert_eq!(verified.return_to, "/forecast?city=Oslo");
        assert!(flow.pending().is_empty());
    }

    #[test]
    fn test_callback_state_is_single_use() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();

        assert!(flow.handle_callback(callback("c", &redirect.state)).is_ok());
        assert!(matches!(
            flow.handle_callback(callback("c", &redirect.state)),
            Err(AuthError::StateNotFound)
        ));
    }

    #[test]
    fn test_racing_callbacks_on_one_state_have_one_winner() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();
        let barrier = std::sync::Barrier::new(8);

        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        flow.handle_callback(callback("c", &redirect.state))
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|result| result.is_ok())
                .count()
        });

        assert_eq!(winners, 1);
        assert!(flow.pending().is_empty());
    }

    #[test]
    fn test_concurrent_logins_are_all_pending() {
        let flow = flow("https://idp.test/");

        let states: std::collections::HashSet<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| flow.begin_login(None).unwrap().state))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(states.len(), 8);
        assert_eq!(flow.pending().len(), 8);
    }

    #[test]
    fn test_unknown_or_missing_state_is_rejected() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();

        let tampered = format!("{}x", redirect.state);
        assert!(matches!(
            flow.handle_callback(callback("c", &tampered)),
            Err(AuthError::StateNotFound)
        ));
        assert!(matches!(
            flow.handle_callback(CallbackParams {
                code: Some("c".to_string()),
                ..Default::default()
            }),
            Err(AuthError::StateNotFound)
        ));
        // The genuine login is still pending
        assert_eq!(flow.pending().len(), 1);
    }

    #[test]
    fn test_idp_error_consumes_pending_login() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();

        let err = flow
            .handle_callback(CallbackParams {
                state: Some(redirect.state.clone()),
                error: Some("access_denied".to_string()),
                error_description: Some("User cancelled".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationDenied { ref error, .. } if error == "access_denied"));
        assert!(flow.pending().is_empty());
    }

    #[test]
    fn test_mismatched_redirect_uri_fails_after_consuming() {
        let flow = flow("https://idp.test/");
        let redirect = flow.begin_login(None).unwrap();

        let mut params = callback("c", &redirect.state);
        params.redirect_uri = Some("https://evil.test/callback".to_string());
        assert!(matches!(
            flow.handle_callback(params),
            Err(AuthError::ExchangeFailed(_))
        ));
        assert!(flow.pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_state_never_reaches_token_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let flow = flow(&format!("{}/", server.uri()));
        flow.begin_login(None).unwrap();
        assert!(flow.handle_callback(callback("c", "forged")).is_err());
    }

    #[tokio::test]
    async fn test_token_response_without_id_token_fails_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let flow = flow(&format!("{}/", server.uri()));
        let redirect = flow.begin_login(None).unwrap();
        let verified = flow.handle_callback(callback("c", &redirect.state)).unwrap();

        assert!(matches!(
            flow.finish_login(verified.exchange).await,
            Err(AuthError::ExchangeFailed(_))
        ));
    }

    #[test]
    fn test_logout_url() {
        let flow = flow("https://idp.test/");
        assert_eq!(
            flow.logout_url().unwrap(),
            "https://idp.test/v2/logout?client_id=client-123&returnTo=https%3A%2F%2Fapp.test%2F"
        );
    }

    #[test]
    fn test_sanitize_return_to() {
        assert_eq!(sanitize_return_to(None), "/");
        assert_eq!(sanitize_return_to(Some("/weather")), "/weather");
        assert_eq!(sanitize_return_to(Some("https://evil.test")), "/");
        assert_eq!(sanitize_return_to(Some("//evil.test")), "/");
        assert_eq!(sanitize_return_to(Some("/\\evil.test")), "/");
        assert_eq!(sanitize_return_to(Some("weather")), "/");
        assert_eq!(sanitize_return_to(Some("/a\r\nSet-Cookie: x")), "/");
    }
}
