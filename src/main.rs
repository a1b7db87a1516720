//! deal-intel service entrypoint.
//! Boots the Axum HTTP server with the run trigger routes and `/metrics`.

use deal_intel::api::{create_router, AppState};
use deal_intel::notify::NotifierMux;
use deal_intel::pipeline::Collaborators;
use deal_intel::telemetry::{init_tracing, Metrics};
use deal_intel::RunConfig;
use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = RunConfig::load().map_err(|e| shuttle_runtime::Error::Custom(e.into()))?;
    let collaborators = Collaborators::from_config(&config)?;
    tracing::info!(
        target: "pipeline",
        entities = ?config.entities,
        mode = %config.retrieval_mode,
        reasoner = collaborators.reasoner.provider_name(),
        "service configured"
    );

    let state = AppState::new(config, collaborators).with_notifier(NotifierMux::from_env());
    let mut router = create_router(state);
    match Metrics::init() {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "metrics disabled"),
    }

    Ok(router.into())
}
