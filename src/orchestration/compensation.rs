//! # Compensation Scheduler
//!
//! Processes EXECUTE_COMPENSATION outbox messages. The payload carries the
//! remaining queue of step ids head-first; each delivery compensates the
//! head with the same reserve/attempt/retry discipline as forward execution,
//! then re-enqueues the tail or finalizes the run as COMPENSATED.

use crate::error::{Result, SagaError};
use crate::http::{ActionExecutor, ExecutionOptions, HttpExecutionResult};
use crate::messaging::message::{CompensationPayload, OutboxMessageType};
use crate::messaging::outbox_client::OutboxClient;
use crate::metrics::EngineMetrics;
use crate::models::run_step::RunStep;
use crate::models::states::{AttemptOutcome, AttemptType};
use crate::models::step_attempt::{NewStepAttempt, StepAttempt};
use crate::models::workflow_definition::{StepDefinition, WorkflowDefinition, WorkflowSpec};
use crate::models::workflow_run::WorkflowRun;
use crate::orchestration::fail_run;
use crate::retry::{backoff_delay_ms, is_transient_failure};
use crate::templating::{envelope, render_request};
use chrono::{Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Derive the compensation queue: the given step ids in definition order,
/// then reversed, which yields reverse causal order.
pub fn compensation_queue(spec: &WorkflowSpec, succeeded_step_ids: &[String]) -> Vec<String> {
    let mut queue: Vec<String> = spec
        .steps
        .iter()
        .filter(|step| succeeded_step_ids.iter().any(|id| id == &step.step_id))
        .map(|step| step.step_id.clone())
        .collect();
    queue.reverse();
    queue
}

enum Reservation {
    Proceed { attempt_no: i32 },
    Skip(&'static str),
}

pub struct CompensationScheduler {
    pool: PgPool,
    executor: Arc<dyn ActionExecutor>,
    metrics: Arc<EngineMetrics>,
}

impl CompensationScheduler {
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

    /// Handle one EXECUTE_COMPENSATION delivery.
    #[instrument(skip(self, payload), fields(run_id = %payload.run_id, queue_len = payload.queue.len()))]
    pub async fn process(&self, payload: &CompensationPayload) -> Result<()> {
        let run_id = payload.run_id;

        // An empty queue means every entry has been settled: finalize.
        if payload.queue.is_empty() {
            return self.finalize_compensated(run_id).await;
        }

        let Some(run) = WorkflowRun::find_by_id(&self.pool, run_id).await? else {
            warn!("run missing, dropping compensation message");
            return Ok(());
        };

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

        let current = payload.queue[0].as_str();
        let remaining = &payload.queue[1..];

        // A queue entry that no longer exists in the definition is dropped.
        let Some(step_def) = spec.step(current) else {
            debug!(step_id = current, "queued step not in definition, continuing");
            return self.continue_with(payload, remaining).await;
        };

        // Steps without a compensation spec are settled as SKIPPED.
        let Some(compensation_spec) = &step_def.compensation else {
            return self.skip_and_continue(payload, current, remaining).await;
        };

        let attempt_no = match self.reserve_compensation(run_id, current).await? {
            Reservation::Proceed { attempt_no } => attempt_no,
            Reservation::Skip(reason) => {
                debug!(step_id = current, reason, "compensation reservation skipped");
                return self.continue_with(payload, remaining).await;
            }
        };

        let data = envelope(&run.input, &run.context, run_id);
        let request = render_request(compensation_spec, &data);
        let options = ExecutionOptions {
            timeout_ms: step_def.timeout_ms,
            extra_headers: vec![
                (
                    "x-idempotency-key".to_string(),
                    format!("{run_id}:{current}:compensation:{attempt_no}"),
                ),
                ("x-correlation-id".to_string(), run.correlation_id()),
            ],
        };
        let result = self.executor.execute(&request, &options).await;
        self.metrics.observe_attempt(result.duration_ms);

        if result.ok {
            self.settle_success(payload, current, remaining, attempt_no, &result)
                .await
        } else {
            self.settle_failure(payload, current, step_def, attempt_no, &result)
                .await
        }
    }

    /// Mark the run COMPENSATED, idempotently; bump the counter only when
    /// this call performed the transition.
    async fn finalize_compensated(&self, run_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;
        let transitioned = WorkflowRun::compensate_if_active(&mut tx, run_id).await?;
        tx.commit().await.map_err(SagaError::from)?;

        if transitioned {
            self.metrics.record_run_compensated();
            info!(run_id = %run_id, "run compensated");
        }
        Ok(())
    }

    /// Re-enqueue the remaining queue immediately, or finalize when it is
    /// exhausted.
    async fn continue_with(
        &self,
        payload: &CompensationPayload,
        remaining: &[String],
    ) -> Result<()> {
        if remaining.is_empty() {
            return self.finalize_compensated(payload.run_id).await;
        }

        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;
        self.enqueue_queue(&mut tx, payload, remaining, Utc::now()).await?;
        tx.commit().await.map_err(SagaError::from)?;
        Ok(())
    }

    /// Settle a step with no compensation spec and continue, in one
    /// transaction.
    async fn skip_and_continue(
        &self,
        payload: &CompensationPayload,
        step_id: &str,
        remaining: &[String],
    ) -> Result<()> {
        let run_id = payload.run_id;
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        RunStep::mark_compensation_skipped(&mut tx, run_id, step_id).await?;

        let mut compensated = false;
        if remaining.is_empty() {
            compensated = WorkflowRun::compensate_if_active(&mut tx, run_id).await?;
        } else {
            self.enqueue_queue(&mut tx, payload, remaining, Utc::now()).await?;
        }
        tx.commit().await.map_err(SagaError::from)?;

        if compensated {
            self.metrics.record_run_compensated();
            info!(run_id = %run_id, "run compensated");
        }
        debug!(step_id, "no compensation spec, step skipped");
        Ok(())
    }

    /// Reserve one compensation attempt under run+step row locks.
    async fn reserve_compensation(&self, run_id: Uuid, step_id: &str) -> Result<Reservation> {
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        if WorkflowRun::lock(&mut tx, run_id).await?.is_none() {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("run_missing"));
        }
        let Some(step) = RunStep::lock(&mut tx, run_id, step_id).await? else {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("step_missing"));
        };
        if step.compensation_status.blocks_compensation() {
            tx.rollback().await.map_err(SagaError::from)?;
            return Ok(Reservation::Skip("compensation_already_settled"));
        }

        let attempt_no = RunStep::begin_compensation(&mut tx, run_id, step_id).await?;
        tx.commit().await.map_err(SagaError::from)?;

        Ok(Reservation::Proceed { attempt_no })
    }

    async fn settle_success(
        &self,
        payload: &CompensationPayload,
        step_id: &str,
        remaining: &[String],
        attempt_no: i32,
        result: &HttpExecutionResult,
    ) -> Result<()> {
        let run_id = payload.run_id;
        let mut tx = self.pool.begin().await.map_err(SagaError::from)?;

        StepAttempt::record(
            &mut tx,
            NewStepAttempt {
                run_id,
                step_id,
                attempt_no,
                attempt_type: AttemptType::Compensation,
                status: AttemptOutcome::Success,
                http_status: result.status_code.map(|c| c as i32),
                duration_ms: result.duration_ms as i64,
                error_message: None,
            },
        )
        .await?;
        RunStep::mark_compensated(&mut tx, run_id, step_id).await?;

        let mut compensated = false;
        if remaining.is_empty() {
            compensated = WorkflowRun::compensate_if_active(&mut tx, run_id).await?;
        } else {
            self.enqueue_queue(&mut tx, payload, remaining, Utc::now()).await?;
        }
        tx.commit().await.map_err(SagaError::from)?;

        if compensated {
            self.metrics.record_run_compensated();
            info!(run_id = %run_id, step_id, attempt_no, "last step compensated, run compensated");
        } else {
            debug!(step_id, attempt_no, "step compensated");
        }
        Ok(())
    }

    /// Compensation failure: record the attempt; a transient failure with
    /// attempts left re-enqueues the same queue (head unchanged) after
    /// backoff, otherwise the run terminally fails.
    async fn settle_failure(
        &self,
        payload: &CompensationPayload,
        step_id: &str,
        step_def: &StepDefinition,
        attempt_no: i32,
        result: &HttpExecutionResult,
    ) -> Result<()> {
        let run_id = payload.run_id;
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
                attempt_type: AttemptType::Compensation,
                status: AttemptOutcome::Fail,
                http_status: result.status_code.map(|c| c as i32),
                duration_ms: result.duration_ms as i64,
                error_message: Some(&error_text),
            },
        )
        .await?;
        RunStep::mark_compensation_failed(&mut tx, run_id, step_id, &error_text).await?;

        let mut run_failed = false;
        if should_retry {
            let delay_ms = backoff_delay_ms(&step_def.retry_policy, attempt_no as u32);
            self.enqueue_queue(
                &mut tx,
                payload,
                &payload.queue,
                Utc::now() + Duration::milliseconds(delay_ms as i64),
            )
            .await?;
            info!(
                step_id,
                attempt_no,
                delay_ms,
                reason = %decision.reason,
                "compensation failed, retry scheduled"
            );
        } else {
            WorkflowRun::mark_failed(
                &mut tx,
                run_id,
                "COMPENSATION_FAILED",
                &format!("compensation of {step_id} failed: {error_text}"),
            )
            .await?;
            run_failed = true;
            warn!(step_id, attempt_no, reason = %decision.reason, "compensation exhausted, run failed");
        }

        tx.commit().await.map_err(SagaError::from)?;
        if run_failed {
            self.metrics.record_run_failed();
        }
        Ok(())
    }

    async fn enqueue_queue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &CompensationPayload,
        queue: &[String],
        next_attempt_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let next = CompensationPayload {
            run_id: payload.run_id,
            queue: queue.to_vec(),
            reason: payload.reason,
        };
        OutboxClient::enqueue(
            tx,
            payload.run_id,
            OutboxMessageType::ExecuteCompensation,
            &next.to_json()?,
            next_attempt_at,
        )
        .await?;
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
