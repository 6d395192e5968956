//! # Schema Bootstrap
//!
//! Idempotent embedded DDL for the engine's five tables. The statements are
//! applied under a Postgres advisory lock so that multiple workers (or
//! parallel test threads) starting against the same database cannot race the
//! schema creation.

use sqlx::PgPool;

/// Advisory lock key for schema initialization, shared by every worker.
const SCHEMA_LOCK_KEY: i64 = 7_430_115_889_021_440;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_definitions (
    id         BIGSERIAL PRIMARY KEY,
    name       TEXT NOT NULL,
    version    TEXT NOT NULL,
    definition JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id           UUID PRIMARY KEY,
    workflow_name    TEXT NOT NULL,
    workflow_version TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    input            JSONB NOT NULL,
    context          JSONB NOT NULL,
    error_code       TEXT,
    error_message    TEXT,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS run_steps (
    run_id                UUID NOT NULL REFERENCES workflow_runs(run_id) ON DELETE CASCADE,
    step_id               TEXT NOT NULL,
    status                TEXT NOT NULL DEFAULT 'PENDING',
    attempts              INTEGER NOT NULL DEFAULT 0,
    last_error            TEXT,
    started_at            TIMESTAMPTZ,
    ended_at              TIMESTAMPTZ,
    output                JSONB,
    compensation_status   TEXT NOT NULL DEFAULT 'PENDING',
    compensation_attempts INTEGER NOT NULL DEFAULT 0,
    compensation_error    TEXT,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (run_id, step_id)
);

CREATE INDEX IF NOT EXISTS idx_run_steps_run_id ON run_steps (run_id);

CREATE TABLE IF NOT EXISTS step_attempts (
    id            BIGSERIAL PRIMARY KEY,
    run_id        UUID NOT NULL REFERENCES workflow_runs(run_id) ON DELETE CASCADE,
    step_id       TEXT NOT NULL,
    attempt_no    INTEGER NOT NULL,
    attempt_type  TEXT NOT NULL,
    status        TEXT NOT NULL,
    http_status   INTEGER,
    duration_ms   BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (run_id, step_id, attempt_no, attempt_type)
);

CREATE INDEX IF NOT EXISTS idx_step_attempts_run_step ON step_attempts (run_id, step_id);

CREATE TABLE IF NOT EXISTS outbox (
    id               BIGSERIAL PRIMARY KEY,
    run_id           UUID NOT NULL REFERENCES workflow_runs(run_id) ON DELETE CASCADE,
    message_type     TEXT NOT NULL,
    payload          JSONB NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    attempts         INTEGER NOT NULL DEFAULT 0,
    next_attempt_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lock_owner       TEXT,
    lock_acquired_at TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_outbox_status_next_attempt ON outbox (status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox (created_at);

CREATE OR REPLACE FUNCTION touch_workflow_runs_updated_at() RETURNS trigger AS $fn$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$fn$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS workflow_runs_touch_updated_at ON workflow_runs;
CREATE TRIGGER workflow_runs_touch_updated_at
    BEFORE UPDATE ON workflow_runs
    FOR EACH ROW EXECUTE FUNCTION touch_workflow_runs_updated_at();
"#;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Ensure the engine schema exists.
    ///
    /// Safe to call from every worker at startup; the advisory lock
    /// serializes concurrent callers and the DDL itself is idempotent.
    pub async fn run_all(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut conn = pool.acquire().await?;

        // Session-scoped lock, so it must be taken and released on the same
        // connection.
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let apply_result = sqlx::raw_sql(SCHEMA_SQL).execute(&mut *conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        apply_result?;
        tracing::debug!("engine schema ensured");
        Ok(())
    }
}
