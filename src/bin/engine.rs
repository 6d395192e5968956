//! Saga Engine Binary
//!
//! Runs one engine worker: the outbox polling loop plus the control API
//! server. Multiple instances can run against the same database; the outbox
//! lease protocol coordinates them.

use anyhow::Context;
use saga_core::database::{DatabaseConnection, DatabaseMigrations};
use saga_core::http::HttpActionExecutor;
use saga_core::logging::init_structured_logging;
use saga_core::messaging::outbox_client::OutboxClient;
use saga_core::metrics::EngineMetrics;
use saga_core::orchestration::{CompensationScheduler, OutboxPoller, StepExecutor};
use saga_core::web::state::AppState;
use saga_core::EngineConfig;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_structured_logging();

    let config = EngineConfig::from_env().context("loading engine configuration")?;
    info!(
        worker_id = %config.worker_id,
        bind_addr = %config.bind_addr,
        "starting saga engine"
    );

    let connection = DatabaseConnection::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let pool = connection.pool().clone();
    DatabaseMigrations::run_all(&pool)
        .await
        .context("ensuring engine schema")?;

    let metrics = Arc::new(EngineMetrics::new());
    let action_executor = Arc::new(HttpActionExecutor::new());

    let poller = OutboxPoller::new(
        &config,
        OutboxClient::new(pool.clone()),
        StepExecutor::new(pool.clone(), action_executor.clone(), metrics.clone()),
        CompensationScheduler::new(pool.clone(), action_executor, metrics.clone()),
        metrics.clone(),
    );
    let poller_task = tokio::spawn(async move { poller.run().await });

    let app = saga_core::web::router(AppState::new(pool, metrics));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving control API")?;

    info!("shutdown requested, stopping poller");
    poller_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    signal::ctrl_c().await.ok();
}
