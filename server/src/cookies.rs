use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse as _, Response},
};
use tracing::error;

pub use tower_cookies::Cookie;

use crate::state::AppState;

/// Private (encrypted and authenticated) cookies, keyed by the app's cookie key.
///
/// Values are opaque to the browser, so a session id cannot be read or forged client-side.
pub struct CookieJar {
    cookies: tower_cookies::Cookies,
    key: tower_cookies::Key,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for CookieJar {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = match tower_cookies::Cookies::from_request_parts(parts, state).await {
            Ok(cookies) => cookies,
            Err(_) => {
                error!("Failed to extract cookies from request, is CookieManagerLayer installed?");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };

        Ok(CookieJar {
            cookies,
            key: state.cookie_key.clone(),
        })
    }
}

impl CookieJar {
    pub fn add(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).add(cookie);
    }

    /// Get and decrypt a cookie. Tampered values read as absent.
    pub fn get(&self, name: &str) -> Option<Cookie<'static>> {
        self.cookies.private(&self.key).get(name)
    }

    pub fn remove(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).remove(cookie);
    }
}
