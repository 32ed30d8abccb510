pub mod api;
pub mod auth;
pub mod cookies;
pub mod cron;
pub mod errors;
pub mod oauth;
pub mod routes;
pub mod setup;
pub mod state;

pub use state::AppState;
