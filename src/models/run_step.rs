//! # Run Step Model
//!
//! Per-run step rows, one per definition step, created at intake. Tracks
//! action state and compensation state independently.

use crate::models::states::{CompensationStatus, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunStep {
    pub run_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub compensation_status: CompensationStatus,
    pub compensation_attempts: i32,
    pub compensation_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

const STEP_COLUMNS: &str = "run_id, step_id, status, attempts, last_error, started_at, ended_at, \
                            output, compensation_status, compensation_attempts, \
                            compensation_error, created_at";

impl RunStep {
    /// Insert one PENDING row per definition step inside the intake
    /// transaction.
    pub async fn create_all(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_ids: &[String],
    ) -> Result<(), sqlx::Error> {
        for step_id in step_ids {
            sqlx::query("INSERT INTO run_steps (run_id, step_id) VALUES ($1, $2)")
                .bind(run_id)
                .bind(step_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    pub async fn find(
        pool: &PgPool,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<RunStep>, sqlx::Error> {
        sqlx::query_as::<_, RunStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = $1 AND step_id = $2"
        ))
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<RunStep>, sqlx::Error> {
        sqlx::query_as::<_, RunStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_all(pool)
        .await
    }

    /// Row-level lock inside the reserving transaction.
    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<RunStep>, sqlx::Error> {
        sqlx::query_as::<_, RunStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = $1 AND step_id = $2 FOR UPDATE"
        ))
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Reserve one action attempt: RUNNING, attempts+1, startedAt backfilled.
    /// Returns the new attempt number.
    pub async fn begin_attempt(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(
            "UPDATE run_steps
             SET status = 'RUNNING', attempts = attempts + 1,
                 started_at = COALESCE(started_at, NOW())
             WHERE run_id = $1 AND step_id = $2
             RETURNING attempts",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_succeeded(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
        output: Option<&serde_json::Value>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET status = 'SUCCEEDED', ended_at = NOW(), output = $3, last_error = NULL
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(output)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET status = 'FAILED', ended_at = NOW(), last_error = $3
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Manual retry: back to PENDING with the failure bookkeeping cleared.
    pub async fn reset_for_retry(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET status = 'PENDING', last_error = NULL, ended_at = NULL
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Step ids that currently stand SUCCEEDED, for compensation queue
    /// derivation. Read inside the same transaction as the transition that
    /// needs it.
    pub async fn succeeded_ids(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT step_id FROM run_steps WHERE run_id = $1 AND status = 'SUCCEEDED'",
        )
        .bind(run_id)
        .fetch_all(&mut **tx)
        .await
    }

    /// Reserve one compensation attempt. Returns the new attempt number.
    pub async fn begin_compensation(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(
            "UPDATE run_steps
             SET compensation_status = 'RUNNING',
                 compensation_attempts = compensation_attempts + 1
             WHERE run_id = $1 AND step_id = $2
             RETURNING compensation_attempts",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// Compensation done: settle the compensation state and, when the action
    /// had succeeded, flip the step itself to COMPENSATED.
    pub async fn mark_compensated(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET compensation_status = 'COMPENSATED',
                 compensation_error = NULL,
                 status = CASE WHEN status = 'SUCCEEDED' THEN 'COMPENSATED' ELSE status END
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_compensation_failed(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET compensation_status = 'FAILED', compensation_error = $3
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// No compensation spec declared for the step.
    pub async fn mark_compensation_skipped(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE run_steps
             SET compensation_status = 'SKIPPED', compensation_error = NULL
             WHERE run_id = $1 AND step_id = $2",
        )
        .bind(run_id)
        .bind(step_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
