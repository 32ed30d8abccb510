use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tower_cookies::Key;
use tracing::{info, warn};

use crate::errors::AuthError;
use crate::oauth::{JwksCache, OAuthFlow, SessionStore, TokenVerifier};

/// The confidential client secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSecret({})", "*".repeat(self.0.len()))
    }
}

/// Everything the backend needs to talk to its one identity provider
#[derive(Debug, Clone)]
pub struct IdpConfig {
    /// Issuer URL exactly as it appears in the `iss` claim
    pub issuer: String,
    pub client_id: String,
    pub client_secret: ClientSecret,
    /// API audience requested at authorize time and required on bearer tokens
    pub audience: Option<String>,
    pub scope: String,
    /// Registered callback. Sent byte-for-byte in both the authorize and token requests.
    pub redirect_uri: String,
    /// Where the IdP sends the browser after end-session
    pub post_logout_redirect_uri: String,
    pub http_timeout: Duration,
}

pub const DEFAULT_SCOPE: &str = "openid profile email offline_access";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

fn require_env(name: &str) -> Result<String, AuthError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AuthError::Configuration(format!(
            "{name} environment variable not set"
        ))),
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl IdpConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        let domain = require_env("DOMAIN")?;
        let protocol = env::var("PROTO").unwrap_or_else(|_| "https".to_string());

        let http_timeout = match optional_env("IDP_HTTP_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(secs.parse().map_err(|_| {
                AuthError::Configuration(format!("IDP_HTTP_TIMEOUT_SECS is not a number: {secs}"))
            })?),
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let config = Self {
            issuer: require_env("IDP_ISSUER")?,
            client_id: require_env("IDP_CLIENT_ID")?,
            client_secret: ClientSecret::new(require_env("IDP_CLIENT_SECRET")?),
            audience: optional_env("IDP_AUDIENCE"),
            scope: optional_env("IDP_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            redirect_uri: format!("{}://{}/callback", protocol, domain),
            post_logout_redirect_uri: format!("{}://{}/", protocol, domain),
            http_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, at the IdP
    pub fn validate(&self) -> Result<(), AuthError> {
        for (name, value) in [
            ("IDP_ISSUER", &self.issuer),
            ("redirect_uri", &self.redirect_uri),
            ("post_logout_redirect_uri", &self.post_logout_redirect_uri),
        ] {
            let url = reqwest::Url::parse(value)
                .map_err(|e| AuthError::Configuration(format!("{name} is not a URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AuthError::Configuration(format!(
                    "{name} must be an http(s) URL"
                )));
            }
            if url.fragment().is_some() {
                return Err(AuthError::Configuration(format!(
                    "{name} must not carry a fragment"
                )));
            }
        }

        if self.client_secret.value().is_empty() {
            return Err(AuthError::Configuration(
                "client secret must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.issuer.trim_end_matches('/'), path)
    }

    pub fn authorize_endpoint(&self) -> String {
        self.endpoint("authorize")
    }

    pub fn token_endpoint(&self) -> String {
        self.endpoint("oauth/token")
    }

    pub fn jwks_uri(&self) -> String {
        self.endpoint(".well-known/jwks.json")
    }

    pub fn end_session_endpoint(&self) -> String {
        self.endpoint("v2/logout")
    }

    /// Audience bearer tokens must carry
    pub fn api_audience(&self) -> &str {
        self.audience.as_deref().unwrap_or(&self.client_id)
    }

    /// Whether cookies should be marked `Secure`
    pub fn secure_cookies(&self) -> bool {
        self.redirect_uri.starts_with("https://")
    }
}

/// Downstream forecast API, reached only through the guarded `/weather` route
#[derive(Clone)]
pub struct WeatherConfig {
    pub api_url: String,
    pub api_key: Option<ClientSecret>,
}

pub const DEFAULT_WEATHER_API_URL: &str = "https://my.meteoblue.com/packages/basic-day";

impl WeatherConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: optional_env("WEATHER_API_URL")
                .unwrap_or_else(|| DEFAULT_WEATHER_API_URL.to_string()),
            api_key: optional_env("METEOBLUE_API_KEY").map(ClientSecret::new),
        }
    }
}

fn cookie_key_from_env() -> Result<Key, AuthError> {
    match optional_env("COOKIE_KEY") {
        Some(encoded) => decode_cookie_key(&encoded),
        None => {
            warn!("COOKIE_KEY not set, generating a key; sessions will not survive a restart");
            Ok(Key::generate())
        }
    }
}

/// Base64 `COOKIE_KEY` into a cookie key. Anything shorter than 64 bytes is rejected.
fn decode_cookie_key(encoded: &str) -> Result<Key, AuthError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthError::Configuration(format!("COOKIE_KEY is not base64: {e}")))?;
    Key::try_from(bytes.as_slice()).map_err(|e| {
        AuthError::Configuration(format!(
            "COOKIE_KEY must decode to at least 64 bytes: {e}"
        ))
    })
}

/// Shared, explicitly passed application state. No credentials live anywhere else.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdpConfig>,
    pub cookie_key: Key,
    pub http: reqwest::Client,
    pub flow: OAuthFlow,
    pub sessions: SessionStore,
    pub verifier: TokenVerifier,
    pub weather: WeatherConfig,
}

impl AppState {
    pub fn from_env() -> Result<Self, AuthError> {
        let config = IdpConfig::from_env()?;
        let cookie_key = cookie_key_from_env()?;
        info!(
            issuer = %config.issuer,
            callback = %config.redirect_uri,
            "Loaded IdP configuration"
        );

        Self::new(config, cookie_key, WeatherConfig::from_env())
    }

    pub fn new(
        config: IdpConfig,
        cookie_key: Key,
        weather: WeatherConfig,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let config = Arc::new(config);

        let http = reqwest::ClientBuilder::new()
            .timeout(config.http_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let jwks = JwksCache::new(config.jwks_uri(), http.clone());
        let verifier = TokenVerifier::new(jwks, config.issuer.clone());
        let flow = OAuthFlow::new(config.clone(), http.clone(), verifier.clone());

        Ok(Self {
            config,
            cookie_key,
            http,
            flow,
            sessions: SessionStore::new(),
            verifier,
            weather,
        })
    }
}
