use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect},
};
use tracing::info;

use crate::{
    auth::{check_login_state, create_session_cookie},
    cookies::CookieJar,
    errors::AuthError,
    oauth::{CallbackParams, SessionId, VerifiedCallback},
    state::AppState,
};

/// Where the IdP sends the browser back to
pub async fn callback(
    State(state): State<AppState>,
    cookies: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse, AuthError> {
    check_login_state(
        &cookies,
        params.state.as_deref(),
        state.config.secure_cookies(),
    )?;
    let verified = state.flow.handle_callback(params)?;
    let return_to = verified.return_to.clone();

    complete_login(&state, &cookies, verified).await?;
    Ok(Redirect::to(&return_to))
}

/// Exchange the code, verify identity, then create the session and set its cookie.
///
/// Nothing is stored unless every step succeeds.
pub(crate) async fn complete_login(
    state: &AppState,
    cookies: &CookieJar,
    verified: VerifiedCallback,
) -> Result<SessionId, AuthError> {
    let (token_set, claims) = state.flow.finish_login(verified.exchange).await?;

    let expires_at = token_set.expires_at;
    let session_id = state.sessions.create(token_set, claims);
    cookies.add(create_session_cookie(
        &session_id,
        expires_at,
        state.config.secure_cookies(),
    ));

    info!(session = ?session_id, "Session cookie issued");
    Ok(session_id)
}
