use axum::{
    extract::State,
    response::{IntoResponse, Redirect},
};
use tracing::info;

use crate::{
    auth::{removal_cookie, session_id_from_cookie},
    cookies::CookieJar,
    errors::AuthError,
    state::AppState,
};

/// Drop the local session, clear the cookie, then hand off to the IdP's end-session page.
///
/// Local invalidation happens first and does not depend on the IdP.
pub async fn logout(
    State(state): State<AppState>,
    cookies: CookieJar,
) -> Result<impl IntoResponse, AuthError> {
    if let Some(session_id) = session_id_from_cookie(&cookies) {
        state.sessions.invalidate(&session_id);
        info!(session = ?session_id, "Logged out");
    }
    cookies.remove(removal_cookie(state.config.secure_cookies()));

    let logout_url = state.flow.logout_url()?;
    Ok(Redirect::to(&logout_url))
}
