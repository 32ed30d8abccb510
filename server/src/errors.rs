use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Failures of the login flow and the resource guard.
///
/// Every variant is terminal for the request or login attempt that produced it: none of
/// them is retried with the same authorization code.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No live pending login matches the callback `state`: forged, replayed or expired.
    #[error("no pending login matches the returned state")]
    StateNotFound,

    /// The IdP redirected back with an `error` instead of a code.
    #[error("identity provider denied the authorization: {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session expired")]
    SessionExpired,

    /// The IdP's signing keys could not be fetched
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::StateNotFound => StatusCode::BAD_REQUEST,
            AuthError::AuthorizationDenied { .. } => StatusCode::UNAUTHORIZED,
            AuthError::ExchangeFailed(_) => StatusCode::BAD_GATEWAY,
            AuthError::Unauthorized(_) | AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
            AuthError::KeysUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the user agent. Details stay in the logs.
    fn public_message(&self) -> &'static str {
        match self {
            AuthError::StateNotFound => "Login attempt expired or was not recognised. Please sign in again.",
            AuthError::AuthorizationDenied { .. } => "Login was cancelled or denied.",
            AuthError::ExchangeFailed(_) => "Login failed.",
            AuthError::Unauthorized(_) | AuthError::SessionExpired => "Authentication required.",
            AuthError::KeysUnavailable(_) => "Unable to verify credentials right now.",
            AuthError::Configuration(_) => "Server misconfigured.",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Authentication error");
        } else {
            tracing::info!(error = %self, "Request rejected");
        }

        let body = Json(json!({ "error": self.public_message() }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// An unexpected failure paired with the response the client should see.
///
/// The report is logged; only `R` reaches the client.
#[derive(Debug)]
pub struct ServerError<R: IntoResponse>(pub(crate) color_eyre::Report, pub(crate) R);

pub type ServerResult<S, F = Response> = Result<S, ServerError<F>>;

impl<R: IntoResponse> IntoResponse for ServerError<R> {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = ?self.0, "Request Error");

        self.1.into_response()
    }
}
