use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use color_eyre::eyre::{eyre, WrapErr as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::{
    auth::{AuthUser, Credential},
    errors::{ServerError, ServerResult},
    state::{AppState, WeatherConfig},
};

#[derive(Serialize)]
pub struct MeResponse {
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub picture: Option<String>,
    /// `session` or `bearer`
    pub authenticated_with: &'static str,
}

/// Who am I? Returns the verified identity of the caller.
pub async fn me(user: AuthUser) -> Json<MeResponse> {
    let authenticated_with = match user.credential {
        Credential::Session(_) => "session",
        Credential::Bearer => "bearer",
    };

    Json(MeResponse {
        sub: user.claims.sub,
        email: user.claims.email,
        name: user.claims.name,
        nickname: user.claims.nickname,
        picture: user.claims.picture,
        authenticated_with,
    })
}

#[derive(Deserialize)]
pub struct WeatherParams {
    pub lat: Option<String>,
    pub lon: Option<String>,
}

type JsonError = (StatusCode, Json<Value>);

fn json_error(status: StatusCode, message: &str) -> JsonError {
    (status, Json(json!({ "error": message })))
}

/// Daily forecast for a coordinate, proxied from the downstream weather API
pub async fn weather(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<WeatherParams>,
) -> ServerResult<Json<Value>, JsonError> {
    let (Some(lat), Some(lon)) = (
        params.lat.as_deref().and_then(parse_coordinate),
        params.lon.as_deref().and_then(parse_coordinate),
    ) else {
        return Err(ServerError(
            eyre!("weather request without usable lat/lon"),
            json_error(StatusCode::BAD_REQUEST, "Missing lat or lon parameter"),
        ));
    };

    if state.weather.api_key.is_none() {
        return Err(ServerError(
            eyre!("METEOBLUE_API_KEY is not configured"),
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Weather data is not available",
            ),
        ));
    }

    info!(sub = %user.claims.sub, lat, lon, "Fetching forecast");
    let forecast = fetch_forecast(&state.http, &state.weather, lat, lon)
        .await
        .map_err(|e| {
            ServerError(
                e,
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to fetch weather data",
                ),
            )
        })?;

    Ok(Json(forecast))
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[instrument(skip(http, config))]
async fn fetch_forecast(
    http: &reqwest::Client,
    config: &WeatherConfig,
    lat: f64,
    lon: f64,
) -> color_eyre::Result<Value> {
    let api_key = config
        .api_key
        .as_ref()
        .ok_or_else(|| eyre!("no weather API key"))?;

    let response = http
        .get(&config.api_url)
        .query(&[
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("format", "json".to_string()),
            ("apikey", api_key.value().to_string()),
        ])
        .send()
        .await
        // The URL carries the API key
        .map_err(reqwest::Error::without_url)
        .wrap_err("weather API unreachable")?;

    if !response.status().is_success() {
        return Err(eyre!("weather API returned {}", response.status()));
    }

    response
        .json::<Value>()
        .await
        .map_err(reqwest::Error::without_url)
        .wrap_err("weather API returned malformed JSON")
}
