use axum::{
    body::Body,
    http::Request,
    routing::{get, post},
    Json,
};
use serde_json::{json, Value};
use tower_cookies::CookieManagerLayer;

use crate::{api, state::AppState};

pub mod idp;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(healthz))
        // Login round trip
        .route("/login", get(idp::login))
        .route("/callback", get(idp::callback))
        .route("/auth/exchange", post(idp::exchange))
        .route("/auth/refresh", post(idp::refresh))
        .route("/logout", get(idp::logout).post(idp::logout))
        // Protected resources
        .route("/api/me", get(api::me))
        .route("/weather", get(api::weather))
        .layer(CookieManagerLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(sentry_tower::SentryHttpLayer::with_transaction())
        .layer(sentry_tower::NewSentryLayer::<Request<Body>>::new_from_top())
        .with_state(app_state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
