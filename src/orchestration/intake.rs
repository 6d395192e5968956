//! # Run Intake
//!
//! Transactional entry points for starting, retrying, and cancelling runs.
//! Each operation commits the run/step mutation and the outbox follow-up in
//! one transaction, so a run can never exist without its scheduled work.

use crate::messaging::message::{
    CompensationPayload, CompensationReason, OutboxMessageType, ScheduledBy, StepPayload,
};
use crate::messaging::outbox_client::OutboxClient;
use crate::models::run_step::RunStep;
use crate::models::states::RunStatus;
use crate::models::workflow_definition::WorkflowDefinition;
use crate::models::workflow_run::WorkflowRun;
use crate::orchestration::compensation::compensation_queue;
use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

/// Tagged intake failures, mapped to HTTP statuses by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("workflow definition not found: {name}")]
    DefinitionNotFound { name: String },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {step_id} in run {run_id}")]
    StepNotFound { run_id: Uuid, step_id: String },

    #[error("run {run_id} is terminal ({status})")]
    RunTerminal { run_id: Uuid, status: RunStatus },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    Compensating,
}

#[derive(Debug, Clone)]
pub struct RunIntake {
    pool: PgPool,
}

impl RunIntake {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start a run: insert the run row, one step row per definition step,
    /// and the EXECUTE_STEP message for the first step, atomically.
    pub async fn start_run(
        &self,
        workflow_name: &str,
        workflow_version: Option<&str>,
        input: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<WorkflowRun, IntakeError> {
        let definition = match workflow_version {
            Some(version) => {
                WorkflowDefinition::find_by_name_version(&self.pool, workflow_name, version).await?
            }
            None => WorkflowDefinition::find_latest(&self.pool, workflow_name).await?,
        }
        .ok_or_else(|| IntakeError::DefinitionNotFound {
            name: workflow_name.to_string(),
        })?;

        let spec = definition
            .spec()
            .map_err(|e| IntakeError::InvalidDefinition(e.to_string()))?;
        let first_step = spec
            .first_step()
            .ok_or_else(|| IntakeError::InvalidDefinition("definition has no steps".to_string()))?;

        let run_id = Uuid::new_v4();
        let step_ids: Vec<String> = spec.steps.iter().map(|s| s.step_id.clone()).collect();

        let mut tx = self.pool.begin().await?;
        let run = WorkflowRun::create(
            &mut tx,
            run_id,
            &definition.name,
            &definition.version,
            &input,
            &context,
        )
        .await?;
        RunStep::create_all(&mut tx, run_id, &step_ids).await?;

        let payload = StepPayload {
            run_id,
            step_id: first_step.step_id.clone(),
            scheduled_by: ScheduledBy::Start,
        };
        OutboxClient::enqueue(
            &mut tx,
            run_id,
            OutboxMessageType::ExecuteStep,
            &payload.to_json().map_err(to_protocol_error)?,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(
            run_id = %run_id,
            workflow = %definition.name,
            version = %definition.version,
            "run started"
        );
        Ok(run)
    }

    /// Manual retry of a specific step: reset the step, put the run back to
    /// RUNNING, and schedule an EXECUTE_STEP immediately.
    pub async fn retry_step(&self, run_id: Uuid, step_id: &str) -> Result<(), IntakeError> {
        let mut tx = self.pool.begin().await?;

        let run = WorkflowRun::lock(&mut tx, run_id)
            .await?
            .ok_or(IntakeError::RunNotFound(run_id))?;
        let _step = RunStep::lock(&mut tx, run_id, step_id)
            .await?
            .ok_or_else(|| IntakeError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })?;

        RunStep::reset_for_retry(&mut tx, run_id, step_id).await?;
        WorkflowRun::mark_running(&mut tx, run_id).await?;

        let payload = StepPayload {
            run_id,
            step_id: step_id.to_string(),
            scheduled_by: ScheduledBy::ManualRetry,
        };
        OutboxClient::enqueue(
            &mut tx,
            run_id,
            OutboxMessageType::ExecuteStep,
            &payload.to_json().map_err(to_protocol_error)?,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(run_id = %run_id, step_id, previous_status = %run.status, "manual step retry scheduled");
        Ok(())
    }

    /// Cancel a run. With `compensate`, previously succeeded steps are
    /// unwound in reverse order; otherwise the run is cancelled in place.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        compensate: bool,
    ) -> Result<CancelOutcome, IntakeError> {
        let mut tx = self.pool.begin().await?;

        let run = WorkflowRun::lock(&mut tx, run_id)
            .await?
            .ok_or(IntakeError::RunNotFound(run_id))?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Compensated) {
            return Err(IntakeError::RunTerminal {
                run_id,
                status: run.status,
            });
        }

        if !compensate {
            WorkflowRun::mark_cancelled(&mut tx, run_id).await?;
            tx.commit().await?;
            info!(run_id = %run_id, "run cancelled without compensation");
            return Ok(CancelOutcome::Cancelled);
        }

        let definition = WorkflowDefinition::find_by_name_version(
            &self.pool,
            &run.workflow_name,
            &run.workflow_version,
        )
        .await?
        .ok_or_else(|| IntakeError::DefinitionNotFound {
            name: run.workflow_name.clone(),
        })?;
        let spec = definition
            .spec()
            .map_err(|e| IntakeError::InvalidDefinition(e.to_string()))?;

        let succeeded = RunStep::succeeded_ids(&mut tx, run_id).await?;
        let queue = compensation_queue(&spec, &succeeded);

        if queue.is_empty() {
            WorkflowRun::mark_cancelled(&mut tx, run_id).await?;
            tx.commit().await?;
            info!(run_id = %run_id, "run cancelled, nothing to compensate");
            return Ok(CancelOutcome::Cancelled);
        }

        WorkflowRun::mark_compensating(
            &mut tx,
            run_id,
            "CANCELLED_BY_USER",
            "run cancelled by user",
        )
        .await?;
        let payload = CompensationPayload {
            run_id,
            queue,
            reason: CompensationReason::Cancel,
        };
        OutboxClient::enqueue(
            &mut tx,
            run_id,
            OutboxMessageType::ExecuteCompensation,
            &payload.to_json().map_err(to_protocol_error)?,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(run_id = %run_id, "run cancelled, compensation scheduled");
        Ok(CancelOutcome::Compensating)
    }
}

fn to_protocol_error(e: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Protocol(format!("payload serialization: {e}"))
}
