//! # Step Attempt Model
//!
//! Append-only attempt history. The uniqueness key
//! `(run_id, step_id, attempt_no, attempt_type)` makes recording idempotent
//! under outbox re-delivery.

use crate::models::states::{AttemptOutcome, AttemptType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepAttempt {
    pub id: i64,
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt_no: i32,
    pub attempt_type: AttemptType,
    pub status: AttemptOutcome,
    pub http_status: Option<i32>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to persist one attempt row.
#[derive(Debug, Clone)]
pub struct NewStepAttempt<'a> {
    pub run_id: Uuid,
    pub step_id: &'a str,
    pub attempt_no: i32,
    pub attempt_type: AttemptType,
    pub status: AttemptOutcome,
    pub http_status: Option<i32>,
    pub duration_ms: i64,
    pub error_message: Option<&'a str>,
}

impl StepAttempt {
    /// Insert an attempt row; a duplicate delivery of the same attempt is a
    /// no-op thanks to the uniqueness key.
    pub async fn record(
        tx: &mut Transaction<'_, Postgres>,
        attempt: NewStepAttempt<'_>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO step_attempts
                 (run_id, step_id, attempt_no, attempt_type, status, http_status,
                  duration_ms, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (run_id, step_id, attempt_no, attempt_type) DO NOTHING",
        )
        .bind(attempt.run_id)
        .bind(attempt.step_id)
        .bind(attempt.attempt_no)
        .bind(attempt.attempt_type.to_string())
        .bind(attempt.status.to_string())
        .bind(attempt.http_status)
        .bind(attempt.duration_ms)
        .bind(attempt.error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_for_step(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Vec<StepAttempt>, sqlx::Error> {
        sqlx::query_as::<_, StepAttempt>(
            "SELECT id, run_id, step_id, attempt_no, attempt_type, status, http_status,
                    duration_ms, error_message, created_at
             FROM step_attempts
             WHERE run_id = $1 AND step_id = $2
             ORDER BY id",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list_for_run(
        pool: &PgPool,
        run_id: Uuid,
    ) -> Result<Vec<StepAttempt>, sqlx::Error> {
        sqlx::query_as::<_, StepAttempt>(
            "SELECT id, run_id, step_id, attempt_no, attempt_type, status, http_status,
                    duration_ms, error_message, created_at
             FROM step_attempts
             WHERE run_id = $1
             ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_step(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
        attempt_type: AttemptType,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM step_attempts
             WHERE run_id = $1 AND step_id = $2 AND attempt_type = $3",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(attempt_type.to_string())
        .fetch_one(pool)
        .await
    }
}
