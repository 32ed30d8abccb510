use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{
    auth::check_login_state, cookies::CookieJar, errors::AuthError, oauth::CallbackParams,
    state::AppState,
};

use super::callback::complete_login;

/// Body posted by script-driven clients that captured the callback themselves.
///
/// There is no `code_verifier` field: the verifier never leaves the backend and is
/// looked up by `state`.
#[derive(Deserialize)]
pub struct ExchangeBody {
    pub code: String,
    pub state: String,
    pub redirect_uri: Option<String>,
}

#[derive(Serialize)]
pub struct ExchangeResponse {
    pub success: bool,
}

/// Same pipeline as the callback, answered with JSON and a session cookie
pub async fn exchange(
    State(state): State<AppState>,
    cookies: CookieJar,
    Json(body): Json<ExchangeBody>,
) -> Result<Json<ExchangeResponse>, AuthError> {
    check_login_state(
        &cookies,
        Some(body.state.as_str()),
        state.config.secure_cookies(),
    )?;
    let verified = state.flow.handle_callback(CallbackParams {
        code: Some(body.code),
        state: Some(body.state),
        redirect_uri: body.redirect_uri,
        ..Default::default()
    })?;

    complete_login(&state, &cookies, verified).await?;
    Ok(Json(ExchangeResponse { success: true }))
}
