//! # Workflow Run Model
//!
//! One row per saga execution. Runs are created by the intake, mutated only
//! inside engine/intake transactions, and never deleted by the engine. The
//! `updated_at` column is touched by a database trigger on every update.

use crate::models::states::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = "run_id, workflow_name, workflow_version, status, input, context, \
                           error_code, error_message, created_at, updated_at";

impl WorkflowRun {
    /// Insert a new PENDING run inside the intake transaction.
    pub async fn create(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        workflow_name: &str,
        workflow_version: &str,
        input: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<WorkflowRun, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            r#"
            INSERT INTO workflow_runs (run_id, workflow_name, workflow_version, status, input, context)
            VALUES ($1, $2, $3, 'PENDING', $4, $5)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(workflow_name)
        .bind(workflow_version)
        .bind(input)
        .bind(context)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        run_id: Uuid,
    ) -> Result<Option<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(pool)
        .await
    }

    /// Row-level lock for the duration of the enclosing transaction. Every
    /// engine transition takes this lock first so concurrent EXECUTE_STEP and
    /// EXECUTE_COMPENSATION deliveries for the same run cannot race.
    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<Option<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = $1 FOR UPDATE"
        ))
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Move the run to RUNNING and clear any previous error fields.
    pub async fn mark_running(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workflow_runs
             SET status = 'RUNNING', error_code = NULL, error_message = NULL
             WHERE run_id = $1",
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workflow_runs
             SET status = 'FAILED', error_code = $2, error_message = $3
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_compensating(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workflow_runs
             SET status = 'COMPENSATING', error_code = $2, error_message = $3
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE workflow_runs SET status = 'CANCELLED' WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Transition to COMPLETED, but only from RUNNING: a cancel or a
    /// compensation start that landed since the attempt was reserved wins.
    /// Returns whether this call performed the transition.
    pub async fn complete_if_active(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'COMPLETED'
             WHERE run_id = $1 AND status = 'RUNNING'",
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition to COMPENSATED idempotently. Returns whether this call
    /// performed the transition, so the caller can bump its counter once.
    pub async fn compensate_if_active(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'COMPENSATED'
             WHERE run_id = $1 AND status NOT IN ('COMPENSATED', 'COMPLETED')",
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Correlation id used for downstream requests: `context.correlationId`
    /// when present, otherwise the run id.
    pub fn correlation_id(&self) -> String {
        self.context
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.run_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_with_context(context: serde_json::Value) -> WorkflowRun {
        WorkflowRun {
            run_id: Uuid::new_v4(),
            workflow_name: "order-processing".to_string(),
            workflow_version: "1.0.0".to_string(),
            status: RunStatus::Pending,
            input: json!({}),
            context,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn correlation_id_prefers_context() {
        let run = run_with_context(json!({"correlationId": "corr-7"}));
        assert_eq!(run.correlation_id(), "corr-7");
    }

    #[test]
    fn correlation_id_falls_back_to_run_id() {
        let run = run_with_context(json!({}));
        assert_eq!(run.correlation_id(), run.run_id.to_string());

        let run = run_with_context(json!({"correlationId": 42}));
        assert_eq!(run.correlation_id(), run.run_id.to_string());
    }
}
