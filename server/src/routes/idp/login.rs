use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect},
};
use serde::Deserialize;

use crate::{
    auth::create_login_state_cookie, cookies::CookieJar, errors::AuthError, state::AppState,
};

#[derive(Deserialize)]
pub struct LoginParams {
    /// Local path to return to after login
    pub return_to: Option<String>,
}

/// Start a login: remember the PKCE verifier, bind the `state` to this browser and send
/// it to the IdP
pub async fn login(
    State(state): State<AppState>,
    cookies: CookieJar,
    Query(params): Query<LoginParams>,
) -> Result<impl IntoResponse, AuthError> {
    let redirect = state.flow.begin_login(params.return_to.as_deref())?;
    cookies.add(create_login_state_cookie(
        &redirect.state,
        state.config.secure_cookies(),
    ));
    Ok(Redirect::to(&redirect.url))
}
