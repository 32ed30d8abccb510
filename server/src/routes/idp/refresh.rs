use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::{
    auth::{create_session_cookie, AuthUser, Credential},
    cookies::CookieJar,
    errors::AuthError,
    state::AppState,
};

#[derive(Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub expires_at: DateTime<Utc>,
}

/// Refresh the current session's tokens with its refresh token
pub async fn refresh(
    State(state): State<AppState>,
    cookies: CookieJar,
    user: AuthUser,
) -> Result<Json<RefreshResponse>, AuthError> {
    let Credential::Session(session_id) = user.credential else {
        return Err(AuthError::Unauthorized(
            "refresh requires a session".to_string(),
        ));
    };

    let session = state.sessions.find(&session_id)?;
    let refresh_token = session
        .token_set
        .refresh_token
        .ok_or_else(|| AuthError::Unauthorized("session has no refresh token".to_string()))?;

    let (token_set, claims) = state.flow.refresh(&refresh_token).await?;
    let session = state.sessions.replace_tokens(&session_id, token_set, claims)?;

    cookies.add(create_session_cookie(
        &session.id,
        session.expires_at,
        state.config.secure_cookies(),
    ));

    info!(session = ?session.id, expires_at = %session.expires_at, "Session refreshed");
    Ok(Json(RefreshResponse {
        success: true,
        expires_at: session.expires_at,
    }))
}
