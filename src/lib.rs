// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod ai;
pub mod api;
pub mod auth;
pub mod config;
pub mod enterprise;
pub mod error;
pub mod history;
pub mod metrics;
pub mod telemetry;

use axum::Router;

pub use crate::api::{create_router, AppState};
pub use crate::config::AppConfig;

/// Router with the API plus `/metrics`.
pub fn build_app(state: AppState) -> anyhow::Result<Router> {
    let metrics = metrics::Metrics::init()?;
    Ok(create_router(state).merge(metrics.router()))
}

/// Load config from file and env and build the full app, as the binary does.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = AppConfig::load()?;
    let state = AppState::from_config(&cfg)?;
    build_app(state)
}
