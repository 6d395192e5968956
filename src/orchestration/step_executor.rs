//! # Step Executor
//!
//! Processes EXECUTE_STEP outbox messages: reserve an attempt under row
//! locks, run the rendered action against the downstream service, persist
//! the attempt, and transition run/step state: scheduling the next step, a
//! retry, or the compensation sweep in the same transaction.

use crate::error::{Result, SagaError};
use crate::http::{ActionExecutor, ExecutionOptions, HttpExecutionResult};
use crate::messaging::message::{
    CompensationPayload, CompensationReason, OutboxMessageType, ScheduledBy, StepPayload,
};
use crate::messaging::outbox_client::OutboxClient;
use crate::metrics::EngineMetrics;
use crate::models::run_step::RunStep;
use crate::models::states::{AttemptOutcome, AttemptType};
use crate::models::step_attempt::{NewStepAttempt, StepAttempt};
use crate::models::workflow_definition::{OnFailure, StepDefinition, WorkflowDefinition, WorkflowSpec};
use crate::models::workflow_run::WorkflowRun;
use crate::orchestration::compensation::compensation_queue;
use crate::orchestration::fail_run;
use crate::retry::{backoff_delay_ms, is_transient_failure};
use crate::templating::{envelope, render_request};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outcome of the reserving transaction.
enum Reservation {
    Proceed { attempt_no: i32 },
    Skip(&'static str),
}

pub struct StepExecutor {
    pool: PgPool,
    executor: Arc<dyn ActionExecutor>,
    metrics: Arc<EngineMetrics>,
}

impl StepExecutor {
    pub fn new(
        pool: PgPool,
        executor: Arc<dyn ActionExecutor>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            pool,
            executor,
            metrics,
        }
    }

    /// Handle one EXECUTE_STEP delivery. Returns `Ok(())` for every settled
    /// outcome (including skips); an `Err` means the poller must requeue the
    /// message.
    #[instrument(skip(self, payload), fields(run_id = %payload.run_id, step_id = %payload.step_id))]
    pub async fn process(&self, payload: &StepPayload) -> Result<()> {
        let run_id = payload.run_id;
        let step_id = payload.step_id.as_str();

        // Phase 1: load the run; a missing or terminal run settles the
        // message without work.
        let Some(run) = WorkflowRun::find_by_id(&self.pool, run_id).await? else {
            warn!("run missing, dropping step message");
            return Ok(());
        };
        if run.status.is_terminal() {
            debug!(status = %run.status, "run already terminal, skipping step");
            return Ok(());
        }

        // Phase 2: load the definition and the step.
        let Some(definition) = WorkflowDefinition::find_by_name_version(
            &self.pool,
            &run.workflow_name,
            &run.workflow_version,
        )
        .await?
        else {
            fail_run(
                &self.pool,
                &self.metrics,
                run_id,
                "WORKFLOW_NOT_FOUND",
                &format!(
                    "definition {}@{} not found",
                    run.workflow_name, run.workflow_version
                ),
            )
            .await?;
            return Ok(());
        };
        let spec = match definition.spec() {
            Ok(spec) => spec,
            Err(e) => {
                fail_run(
                    &self.pool,
                    &self.metrics,
                    run_id,
                    "WORKFLOW_NOT_FOUND",
                    &format!("definition unparsable: {e}"),
                )
                .await?;
                return Ok(());
            }
        };
        let Some(step_def) = spec.step(step_id) else {
            fail_run(
                &self.pool,
                &self.metrics,
                run_id,
                "STEP_NOT_FOUND",
                &format!("step {step_id} not in definition"),
            )
            .await?;
            return Ok(());
        };

        // Phase 3: reserve the attempt under run+step row locks.
        let attempt_no = match self.reserve_attempt(run_id, step_id).await? {
            Reservation::Proceed { attempt_no } => attempt_no,
            Reservation::Skip(reason) => {
                debug!(reason, "step reservation skipped");
                return Ok(());
            }
        };

        // Phase 4: render and execute the action.
        let data = envelope(&run.input, &run.context, run_id);
        let request = render_request(&step_def.action, &data);
        let options = ExecutionOptions {
            timeout_ms: step_def.timeout_ms,
            extra_headers: vec![
                (
                    "x-idempotency-key".to_string(),
                    format!("{run_id}:{step_id}:{attempt_no}"),
                ),
                ("x-correlation-id".to_string(), run.correlation_id()),
            ],
        };
        let result = self.executor.execute(&request, &options).await;
        self.metrics.observe_attempt(result.duration_ms);

        // Phase 5: settle.
        if result.ok {
            self.settle_success(run_id, step_id, attempt_no, &spec, &result)
                .await
        } else {
            self.settle_failure(run_id, step_id, attempt_no, step_def, &spec, &result)
                .await
        }
    }

    /// Reserve one attempt inside a transaction: lock the run, bail on
    /// terminal state; lock the step, bail when a previous or concurrent
    /// delivery already owns it; move the run to RUNNING and bump the step.
    async fn reserve_attempt(&self, run_id: Uuid, step_id: &str) -> Result<Reservation> {
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        let Some(run) = WorkflowRun::lock(&mut tx, run_id).await? else {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("run_missing"));
        };
        if run.status.is_terminal() {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("run_terminal"));
        }

        let Some(step) = RunStep::lock(&mut tx, run_id, step_id).await? else {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("step_missing"));
        };
        if step.status.blocks_execution() {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("step_already_owned"));
        }

        // A run that is compensating or cancelled must not pick up stale
        // EXECUTE_STEP deliveries.
        if !run.status.allows_execution() {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("run_not_executable"));
        }

        WorkflowRun::mark_running(&mut tx, run_id).await?;
        let attempt_no = RunStep::begin_attempt(&mut tx, run_id, step_id).await?;
        tx.commit().await.map_err(SagaError::from)?;

        Ok(Reservation::Proceed { attempt_no })
    }

    /// Success: record the attempt, mark the step SUCCEEDED, and either
    /// schedule the next step or complete the run, in one transaction.
    async fn settle_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: i32,
        spec: &WorkflowSpec,
        result: &HttpExecutionResult,
    ) -> Result<()> {
        let next_step = spec.next_step_after(step_id).map(|s| s.step_id.clone());
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        StepAttempt::record(
            &mut tx,
            NewStepAttempt {
                run_id,
                step_id,
                attempt_no,
                attempt_type: AttemptType::Action,
                status: AttemptOutcome::Success,
                http_status: result.status_code.map(|c| c as i32),
                duration_ms: result.duration_ms as i64,
                error_message: None,
            },
        )
        .await?;
        RunStep::mark_succeeded(&mut tx, run_id, step_id, result.body.as_ref()).await?;

        let mut completed = false;
        match &next_step {
            Some(next_step_id) => {
                let payload = StepPayload {
                    run_id,
                    step_id: next_step_id.clone(),
                    scheduled_by: ScheduledBy::NextStep,
                };
                OutboxClient::enqueue(
                    &mut tx,
                    run_id,
                    OutboxMessageType::ExecuteStep,
                    &payload.to_json()?,
                    Utc::now(),
                )
                .await?;
            }
            None => {
                completed = WorkflowRun::complete_if_active(&mut tx, run_id).await?;
            }
        }
        tx.commit().await.map_err(SagaError::from)?;

        if completed {
            self.metrics.record_run_completed();
            info!(attempt_no, "final step succeeded, run completed");
        } else {
            debug!(attempt_no, next_step = next_step.as_deref(), "step succeeded");
        }
        Ok(())
    }

    /// Failure: record the attempt and the step failure, then schedule a
    /// retry, start the compensation sweep, or fail the run, in one
    /// transaction.
    async fn settle_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: i32,
        step_def: &StepDefinition,
        spec: &WorkflowSpec,
        result: &HttpExecutionResult,
    ) -> Result<()> {
        let decision = is_transient_failure(
            result.timed_out,
            result.network_error,
            result.status_code,
            step_def.retry_policy.retry_on_409,
        );
        let should_retry =
            decision.retryable && (attempt_no as u32) < step_def.retry_policy.max_attempts;
        let error_text = failure_text(result);

        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        StepAttempt::record(
            &mut tx,
            NewStepAttempt {
                run_id,
                step_id,
                attempt_no,
                attempt_type: AttemptType::Action,
                status: AttemptOutcome::Fail,
                http_status: result.status_code.map(|c| c as i32),
                duration_ms: result.duration_ms as i64,
                error_message: Some(&error_text),
            },
        )
        .await?;
        RunStep::mark_failed(&mut tx, run_id, step_id, &error_text).await?;

        let mut run_failed = false;
        if should_retry {
            let delay_ms = backoff_delay_ms(&step_def.retry_policy, attempt_no as u32);
            let payload = StepPayload {
                run_id,
                step_id: step_id.to_string(),
                scheduled_by: ScheduledBy::Retry,
            };
            OutboxClient::enqueue(
                &mut tx,
                run_id,
                OutboxMessageType::ExecuteStep,
                &payload.to_json()?,
                Utc::now() + Duration::milliseconds(delay_ms as i64),
            )
            .await?;
            info!(
                attempt_no,
                delay_ms,
                reason = %decision.reason,
                "step failed, retry scheduled"
            );
        } else {
            let mut compensating = false;
            if step_def.on_failure == OnFailure::Compensate {
                let succeeded = RunStep::succeeded_ids(&mut tx, run_id).await?;
                let queue = compensation_queue(spec, &succeeded);
                if !queue.is_empty() {
                    WorkflowRun::mark_compensating(
                        &mut tx,
                        run_id,
                        "STEP_FAILED",
                        &format!("step {step_id} failed: {error_text}"),
                    )
                    .await?;
                    let payload = CompensationPayload {
                        run_id,
                        queue,
                        reason: CompensationReason::StepFailure,
                    };
                    OutboxClient::enqueue(
                        &mut tx,
                        run_id,
                        OutboxMessageType::ExecuteCompensation,
                        &payload.to_json()?,
                        Utc::now(),
                    )
                    .await?;
                    compensating = true;
                    info!(attempt_no, reason = %decision.reason, "step failed, compensation scheduled");
                }
            }

            if !compensating {
                WorkflowRun::mark_failed(
                    &mut tx,
                    run_id,
                    "STEP_FAILED",
                    &format!("step {step_id} failed: {error_text}"),
                )
                .await?;
                run_failed = true;
                warn!(attempt_no, reason = %decision.reason, "step failed, run failed");
            }
        }

        tx.commit().await.map_err(SagaError::from)?;
        if run_failed {
            self.metrics.record_run_failed();
        }
        Ok(())
    }
}

fn failure_text(result: &HttpExecutionResult) -> String {
    if let Some(message) = &result.error_message {
        return message.clone();
    }
    match result.status_code {
        Some(status) => format!("HTTP {status}"),
        None => "request failed".to_string(),
    }
}
