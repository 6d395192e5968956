//! # Transactional Outbox Client
//!
//! Queue operations over the `outbox` table. Enqueue happens inside the
//! transaction of the state change that schedules the work; claiming uses a
//! single skip-locked statement so at most one worker owns a row at a time,
//! with lease expiry as the crash-recovery path.

use crate::messaging::message::OutboxMessageType;
use crate::models::outbox_message::OutboxMessage;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

/// Point-in-time outbox gauges, refreshed after each poll tick.
#[derive(Debug, Clone)]
pub struct OutboxStats {
    pub pending_count: i64,
    pub oldest_pending_age_seconds: Option<i64>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutboxClient {
    pool: PgPool,
}

impl OutboxClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a message inside the caller's transaction, becoming visible
    /// at `next_attempt_at`.
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        message_type: OutboxMessageType,
        payload: &serde_json::Value,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO outbox (run_id, message_type, payload, next_attempt_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(run_id)
        .bind(message_type.to_string())
        .bind(payload)
        .bind(next_attempt_at)
        .fetch_one(&mut **tx)
        .await?;

        debug!(
            msg_id = id,
            run_id = %run_id,
            message_type = %message_type,
            "📤 OUTBOX: message enqueued"
        );
        Ok(id)
    }

    /// Claim the oldest workable row, if any, in one atomic statement.
    ///
    /// A row is workable when it is PENDING and due, or when it is IN_FLIGHT
    /// but its lease expired (a worker crashed mid-processing). Rows locked
    /// by concurrent claimers are skipped rather than waited on.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_ttl_ms: u64,
    ) -> Result<Option<OutboxMessage>, sqlx::Error> {
        let message = sqlx::query_as::<_, OutboxMessage>(
            r#"
            WITH next_message AS (
                SELECT id FROM outbox
                WHERE (status = 'PENDING' AND next_attempt_at <= NOW())
                   OR (status = 'IN_FLIGHT'
                       AND lock_acquired_at < NOW() - ($2::bigint * INTERVAL '1 millisecond'))
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o
            SET status = 'IN_FLIGHT',
                lock_owner = $1,
                lock_acquired_at = NOW(),
                attempts = o.attempts + 1
            FROM next_message
            WHERE o.id = next_message.id
            RETURNING o.id, o.run_id, o.message_type, o.payload, o.status, o.attempts,
                      o.next_attempt_at, o.lock_owner, o.lock_acquired_at, o.created_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_ttl_ms as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = &message {
            debug!(
                msg_id = message.id,
                run_id = %message.run_id,
                message_type = %message.message_type,
                attempts = message.attempts,
                worker_id,
                "📥 OUTBOX: message claimed"
            );
        }
        Ok(message)
    }

    /// Ack a processed row and release the lease.
    pub async fn mark_done(&self, msg_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE outbox
             SET status = 'DONE', lock_owner = NULL, lock_acquired_at = NULL
             WHERE id = $1",
        )
        .bind(msg_id)
        .execute(&self.pool)
        .await?;

        debug!(msg_id, "✅ OUTBOX: message done");
        Ok(())
    }

    /// Put a row back on the queue after a processing failure.
    pub async fn requeue(&self, msg_id: i64, delay_ms: u64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE outbox
             SET status = 'PENDING',
                 next_attempt_at = NOW() + ($2::bigint * INTERVAL '1 millisecond'),
                 lock_owner = NULL,
                 lock_acquired_at = NULL
             WHERE id = $1",
        )
        .bind(msg_id)
        .bind(delay_ms as i64)
        .execute(&self.pool)
        .await?;

        warn!(msg_id, delay_ms, "OUTBOX: message requeued after processing failure");
        Ok(())
    }

    /// Best-effort backlog gauges: PENDING count and oldest-pending age.
    pub async fn stats(&self) -> Result<OutboxStats, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE status = 'PENDING') AS pending_count,
                    EXTRACT(EPOCH FROM (NOW() - MIN(created_at) FILTER (WHERE status = 'PENDING')))::bigint
                        AS oldest_pending_age_seconds
             FROM outbox",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending_count: row.get("pending_count"),
            oldest_pending_age_seconds: row.get("oldest_pending_age_seconds"),
            collected_at: Utc::now(),
        })
    }
}
