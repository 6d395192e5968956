//! # Orchestration Engine
//!
//! The durable execution core: intake seeds the outbox, the poller claims
//! work under lease, and the step executor / compensation scheduler advance
//! run state inside store transactions that also enqueue the follow-up
//! outbox row.

pub mod compensation;
pub mod intake;
pub mod poller;
pub mod step_executor;

pub use compensation::{compensation_queue, CompensationScheduler};
pub use intake::{IntakeError, RunIntake};
pub use poller::OutboxPoller;
pub use step_executor::StepExecutor;

use crate::metrics::EngineMetrics;
use crate::models::workflow_run::WorkflowRun;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Terminally fail a run with a definition-level error code, unless an
/// absorbing status already won.
pub(crate) async fn fail_run(
    pool: &PgPool,
    metrics: &Arc<EngineMetrics>,
    run_id: Uuid,
    error_code: &str,
    error_message: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let Some(run) = WorkflowRun::lock(&mut tx, run_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    if run.status.is_absorbing() {
        tx.rollback().await?;
        return Ok(());
    }

    WorkflowRun::mark_failed(&mut tx, run_id, error_code, error_message).await?;
    tx.commit().await?;

    warn!(run_id = %run_id, error_code, error_message, "run terminally failed");
    metrics.record_run_failed();
    Ok(())
}
