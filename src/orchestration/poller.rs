//! # Outbox Poller
//!
//! The single cooperative loop of an engine worker: claim up to a batch of
//! due outbox rows, dispatch each to the step executor or the compensation
//! scheduler, ack or requeue, refresh the backlog gauges, sleep.
//!
//! Multiple workers run the same loop against the same store; the claim
//! statement's skip-locked lease protocol is the only coordination between
//! them.

use crate::config::EngineConfig;
use crate::error::{Result, SagaError};
use crate::messaging::message::{CompensationPayload, OutboxMessageType, StepPayload};
use crate::messaging::outbox_client::OutboxClient;
use crate::metrics::EngineMetrics;
use crate::models::outbox_message::OutboxMessage;
use crate::orchestration::compensation::CompensationScheduler;
use crate::orchestration::step_executor::StepExecutor;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Claim at most this many messages per tick before sleeping.
const MAX_MESSAGES_PER_TICK: usize = 10;

/// Requeue delay after an unexpected processing error.
const REQUEUE_DELAY_MS: u64 = 5_000;

pub struct OutboxPoller {
    client: OutboxClient,
    step_executor: StepExecutor,
    compensation: CompensationScheduler,
    metrics: Arc<EngineMetrics>,
    worker_id: String,
    poll_interval: std::time::Duration,
    lease_ttl_ms: u64,
}

impl OutboxPoller {
    pub fn new(
        config: &EngineConfig,
        client: OutboxClient,
        step_executor: StepExecutor,
        compensation: CompensationScheduler,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            client,
            step_executor,
            compensation,
            metrics,
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval(),
            lease_ttl_ms: config.lease_ttl_ms,
        }
    }

    /// Poll forever. Callers abort the task for shutdown; every message is
    /// either acked DONE or requeued, so killing the loop mid-flight only
    /// delays work until the lease expires.
    pub async fn run(&self) {
        tracing::info!(
            worker_id = %self.worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            lease_ttl_ms = self.lease_ttl_ms,
            "outbox poller started"
        );

        loop {
            self.tick().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One poll tick. Exposed so tests can drive the engine
    /// deterministically. Returns the number of messages processed.
    pub async fn tick(&self) -> usize {
        let mut processed = 0;

        for _ in 0..MAX_MESSAGES_PER_TICK {
            if !self.tick_once().await {
                break;
            }
            processed += 1;
        }

        self.refresh_gauges().await;
        processed
    }

    /// Claim and process at most one message. Returns whether one was
    /// claimed.
    pub async fn tick_once(&self) -> bool {
        match self.client.claim_next(&self.worker_id, self.lease_ttl_ms).await {
            Ok(Some(message)) => {
                self.process_message(&message).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "outbox claim failed");
                false
            }
        }
    }

    #[instrument(skip(self, message), fields(msg_id = message.id, message_type = %message.message_type))]
    async fn process_message(&self, message: &OutboxMessage) {
        match self.dispatch(message).await {
            Ok(()) => {
                if let Err(e) = self.client.mark_done(message.id).await {
                    error!(error = %e, "failed to ack outbox message");
                }
            }
            Err(e) => {
                error!(error = %e, "message processing failed, requeueing");
                if let Err(requeue_err) = self.client.requeue(message.id, REQUEUE_DELAY_MS).await {
                    error!(error = %requeue_err, "failed to requeue outbox message");
                }
            }
        }
    }

    async fn dispatch(&self, message: &OutboxMessage) -> Result<()> {
        match message.message_type {
            OutboxMessageType::ExecuteStep => {
                let payload = StepPayload::from_json(&message.payload)
                    .map_err(|e| SagaError::MessagingError(format!("step payload: {e}")))?;
                self.step_executor.process(&payload).await
            }
            OutboxMessageType::ExecuteCompensation => {
                let payload = CompensationPayload::from_json(&message.payload)
                    .map_err(|e| SagaError::MessagingError(format!("compensation payload: {e}")))?;
                self.compensation.process(&payload).await
            }
        }
    }

    /// Best-effort backlog gauges after each tick.
    async fn refresh_gauges(&self) {
        match self.client.stats().await {
            Ok(stats) => {
                self.metrics
                    .set_outbox_gauges(stats.pending_count, stats.oldest_pending_age_seconds);
                debug!(
                    backlog = stats.pending_count,
                    oldest_age_s = stats.oldest_pending_age_seconds,
                    "outbox gauges refreshed"
                );
            }
            Err(e) => debug!(error = %e, "outbox stats refresh failed"),
        }
    }
}
