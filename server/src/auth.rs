//! Resource guard: who is making this request, and may they?

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tower_cookies::cookie::SameSite;
use time::Duration;
use tracing::{debug, warn};

use crate::cookies::{Cookie, CookieJar};
use crate::errors::AuthError;
use crate::oauth::pending::PENDING_LOGIN_TTL_MINUTES;
use crate::oauth::{Claims, SessionId};
use crate::state::AppState;

/// Cookie name for storing the session ID
pub const SESSION_COOKIE_NAME: &str = "wg_session";

/// Cookie binding an in-flight login to the browser that started it
pub const LOGIN_STATE_COOKIE_NAME: &str = "wg_login_state";

/// How the caller proved who they are
#[derive(Debug, Clone)]
pub enum Credential {
    Session(SessionId),
    Bearer,
}

/// The verified caller of a protected route.
///
/// A bearer token in `Authorization` takes precedence over the session cookie. The guard
/// only reads state; it never extends or creates sessions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
    pub credential: Credential,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
            let token = bearer_token(value.as_bytes())
                .ok_or_else(|| {
                    AuthError::Unauthorized("malformed Authorization header".to_string())
                        .into_response()
                })?
                .to_string();

            let claims = state
                .verifier
                .verify(&token, state.config.api_audience())
                .await
                .map_err(IntoResponse::into_response)?;

            return Ok(AuthUser {
                claims,
                credential: Credential::Bearer,
            });
        }

        let cookies = CookieJar::from_request_parts(parts, state).await?;
        let session_id = session_id_from_cookie(&cookies).ok_or_else(|| {
            debug!("No credential presented");
            AuthError::Unauthorized("missing credential".to_string()).into_response()
        })?;

        let session = state
            .sessions
            .find(&session_id)
            .map_err(IntoResponse::into_response)?;

        Ok(AuthUser {
            claims: session.claims,
            credential: Credential::Session(session.id),
        })
    }
}

/// `Bearer <token>`, scheme matched case-insensitively
fn bearer_token(value: &[u8]) -> Option<&str> {
    let value = std::str::from_utf8(value).ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub fn session_id_from_cookie(cookies: &CookieJar) -> Option<SessionId> {
    cookies
        .get(SESSION_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
        .map(SessionId::from)
}

/// HTTP-only session cookie that lives no longer than the session it points at
pub fn create_session_cookie(
    session_id: &SessionId,
    expires_at: DateTime<Utc>,
    secure: bool,
) -> Cookie<'static> {
    let remaining = (expires_at - Utc::now()).num_seconds().max(0);

    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, session_id.as_str().to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    // Lax so the cookie is sent on the top-level redirect back from the IdP
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(Duration::seconds(remaining));
    cookie
}

/// A cookie that, when removed from the jar, clears the session cookie in the browser
pub fn removal_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, "");
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie
}

/// Holds the login's `state` in this browser for as long as the pending login lives
pub fn create_login_state_cookie(state: &str, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(LOGIN_STATE_COOKIE_NAME, state.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(Duration::minutes(PENDING_LOGIN_TTL_MINUTES));
    cookie
}

/// The returned `state` must be the one this browser was given at `/login`.
///
/// Checked before the pending login is consumed, so a callback replayed into another
/// browser leaves the real login untouched. On a match the binding cookie is cleared.
pub fn check_login_state(
    cookies: &CookieJar,
    presented: Option<&str>,
    secure: bool,
) -> Result<(), AuthError> {
    let bound = cookies
        .get(LOGIN_STATE_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string());

    match (bound.as_deref(), presented) {
        (Some(bound), Some(presented)) if !bound.is_empty() && bound == presented => {
            let mut removal = Cookie::new(LOGIN_STATE_COOKIE_NAME, "");
            removal.set_path("/");
            removal.set_http_only(true);
            removal.set_secure(secure);
            cookies.remove(removal);
            Ok(())
        }
        (None, _) => {
            warn!("Callback arrived without a login state cookie");
            Err(AuthError::StateNotFound)
        }
        _ => {
            warn!("Callback state does not match this browser's login");
            Err(AuthError::StateNotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(b"Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token(b"bearer abc"), Some("abc"));
        assert_eq!(bearer_token(b"Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token(b"Bearer "), None);
        assert_eq!(bearer_token(b"Bearer"), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let id = SessionId::from("opaque-id".to_string());
        let cookie = create_session_cookie(&id, Utc::now() + chrono::Duration::hours(1), true);

        assert_eq!(cookie.name(), SESSION_COOKIE_NAME);
        assert_eq!(cookie.value(), "opaque-id");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        let max_age = cookie.max_age().unwrap();
        assert!(max_age <= Duration::hours(1) && max_age > Duration::minutes(59));
    }

    #[test]
    fn test_expired_session_gets_zero_max_age() {
        let id = SessionId::from("opaque-id".to_string());
        let cookie = create_session_cookie(&id, Utc::now() - chrono::Duration::hours(1), false);
        assert_eq!(cookie.max_age(), Some(Duration::ZERO));
    }

    #[test]
    fn test_login_state_cookie_lives_as_long_as_pending_login() {
        let cookie = create_login_state_cookie("abc", true);

        assert_eq!(cookie.name(), LOGIN_STATE_COOKIE_NAME);
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(
            cookie.max_age(),
            Some(Duration::minutes(PENDING_LOGIN_TTL_MINUTES))
        );
    }
}
