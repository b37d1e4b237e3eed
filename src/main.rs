//! Growth engine service entrypoint.
//! Boots the Axum HTTP server with pricing, viral content, optimization and
//! escrow routes.

use growth_engine::{ai::adapter::quick_self_check, build_app, telemetry, AppConfig, AppState};
use shuttle_axum::ShuttleAxum;
use tracing::info;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let cfg = AppConfig::load()?;
    let state = AppState::from_config(&cfg)?;

    if std::env::var("AI_SELF_CHECK").is_ok_and(|v| v == "1") {
        quick_self_check(state.llm.as_ref()).await;
    }

    let router = build_app(state)?;
    info!(
        ai_enabled = cfg.ai.enabled,
        model = %cfg.ai.model,
        "growth engine ready"
    );
    Ok(router.into())
}
