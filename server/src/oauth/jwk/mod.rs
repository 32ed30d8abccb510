//! Signing-key cache and JWT verification against the IdP's published JWKS.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::errors::AuthError;

/// How long fetched keys are trusted before a refetch (10 minutes)
pub const DEFAULT_JWKS_CACHE_TTL: Duration = Duration::from_secs(600);

/// Minimum gap between refetches triggered by an unknown `kid`
pub const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Clock skew tolerated on `exp`/`nbf`, in seconds
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Signature algorithms we accept. Symmetric algorithms are never valid for IdP tokens.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[derive(Clone)]
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS fetched from a single IdP, cached with a TTL
#[derive(Clone)]
pub struct JwksCache {
    jwks_uri: String,
    http: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
    cached: Arc<RwLock<Option<CachedJwks>>>,
    /// Serialises fetches so concurrent misses produce one request
    refresh_lock: Arc<Mutex<()>>,
}

impl JwksCache {
    pub fn new(jwks_uri: String, http: reqwest::Client) -> Self {
        Self::with_ttl(jwks_uri, http, DEFAULT_JWKS_CACHE_TTL)
    }

    pub fn with_ttl(jwks_uri: String, http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            jwks_uri,
            http,
            ttl,
            min_refresh_interval: MIN_FORCED_REFRESH_INTERVAL,
            cached: Arc::new(RwLock::new(None)),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Decoding key for `kid`.
    ///
    /// A cached set is used while fresh. An unknown `kid` forces one refetch, rate limited
    /// by a minimum interval, to pick up rotated keys.
    #[instrument(skip(self))]
    pub async fn find_key(&self, kid: &str) -> Result<Option<DecodingKey>, AuthError> {
        let keys = self.get_keys().await?;
        if let Some(jwk) = keys.find(kid) {
            return to_decoding_key(jwk).map(Some);
        }

        debug!(kid, "Key id not in cached JWKS");
        let keys = self.force_refresh().await?;
        match keys.find(kid) {
            Some(jwk) => to_decoding_key(jwk).map(Some),
            None => Ok(None),
        }
    }

    async fn get_keys(&self) -> Result<JwkSet, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        self.fetch_and_store().await
    }

    /// Refetch unless the last fetch was too recent, in which case the cached set is returned
    async fn force_refresh(&self) -> Result<JwkSet, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < self.min_refresh_interval {
                    debug!("JWKS refreshed recently, not refetching");
                    return Ok(cached.keys.clone());
                }
            }
        }

        info!(jwks_uri = %self.jwks_uri, "Force refreshing JWKS");
        self.fetch_and_store().await
    }

    async fn fetch_and_store(&self) -> Result<JwkSet, AuthError> {
        let keys = self.fetch_jwks().await?;

        let mut cached = self.cached.write().await;
        *cached = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });

        info!(jwks_uri = %self.jwks_uri, key_count = keys.keys.len(), "JWKS cached");
        Ok(keys)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::KeysUnavailable(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("JSON parse error: {e}")))
    }
}

fn to_decoding_key(jwk: &jsonwebtoken::jwk::Jwk) -> Result<DecodingKey, AuthError> {
    DecodingKey::from_jwk(jwk)
        .map_err(|e| AuthError::KeysUnavailable(format!("unusable JWK: {e}")))
}

/// `aud` may be a single string or an array
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

/// Claims we read from access and ID tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Verifies JWTs issued by the configured IdP
#[derive(Clone)]
pub struct TokenVerifier {
    jwks: JwksCache,
    issuer: String,
    leeway: u64,
}

impl TokenVerifier {
    pub fn new(jwks: JwksCache, issuer: String) -> Self {
        Self {
            jwks,
            issuer,
            leeway: DEFAULT_LEEWAY_SECS,
        }
    }

    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    /// Check signature, issuer, audience and expiry.
    ///
    /// Anything wrong with the token itself is `Unauthorized`. Only a failure to obtain
    /// signing keys is reported as `KeysUnavailable`.
    #[instrument(skip(self, token))]
    pub async fn verify(&self, token: &str, audience: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::Unauthorized(format!("malformed token: {e}")))?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::Unauthorized(format!(
                "algorithm {:?} not accepted",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::Unauthorized("token has no key id".to_string()))?;

        let key = self.jwks.find_key(&kid).await?.ok_or_else(|| {
            warn!(kid = %kid, "Token signed with unknown key");
            AuthError::Unauthorized("unknown signing key".to_string())
        })?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.leeway;

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
                ErrorKind::InvalidAudience => "audience mismatch".to_string(),
                ErrorKind::InvalidSignature => "bad signature".to_string(),
                other => format!("invalid token: {other:?}"),
            };
            AuthError::Unauthorized(reason)
        })?;

        Ok(data.claims)
    }
}
