use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vehicle_risk::features::{FEATURE_DIM, FEATURE_NAMES};
use vehicle_risk::model::ScorerHandle;
use vehicle_risk::server::{self, AppState};
use vehicle_risk::store::{self, StateStore};
use vehicle_risk::{Pipeline, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServiceConfig::from_env().context("failed to load configuration")?;

    // Refuse to serve without usable artifacts.
    let scorer = ScorerHandle::load(cfg.artifact_path.clone())
        .with_context(|| format!("failed to load scoring artifacts from {}", cfg.artifact_path.display()))?;
    let warm = scorer
        .current()
        .score(&[0.0; FEATURE_DIM])
        .context("warmup score failed")?;
    tracing::info!(
        version = scorer.current().version(),
        warmup_probability = warm,
        "loaded scoring artifacts; feature order {:?}",
        FEATURE_NAMES
    );

    let store = Arc::new(StateStore::new(cfg.max_vehicles));
    let sweeper = store::spawn_idle_sweeper(Arc::clone(&store), cfg.idle_ttl(), cfg.sweep_interval());

    let pipeline = Pipeline::new(store, Arc::new(scorer), cfg.score_timeout())
        .log_predictions(cfg.log_predictions);
    let app = server::router(AppState::new(pipeline, &cfg));

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
