//! # Workflow Definition Model
//!
//! Declarative workflow definitions, stored as one JSONB document per
//! `(name, version)`. The engine loads the definition per run from the store;
//! there is no in-memory catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A row in `workflow_definitions`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowDefinition {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Parsed definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub name: String,
    pub version: String,
    pub steps: Vec<StepDefinition>,
}

/// One declarative step: an action, an optional compensation, a timeout, and
/// a retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub step_id: String,
    pub action: HttpRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<HttpRequestSpec>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub idempotency_scope: IdempotencyScope,
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// A declarative HTTP request, rendered against the run envelope before
/// execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<std::collections::HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    #[serde(default)]
    pub retry_on_409: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
            retry_on_409: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyScope {
    #[default]
    Run,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Compensate,
    Halt,
}

impl WorkflowSpec {
    /// Structural validation applied on registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("workflow must declare at least one step".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err("stepId must not be empty".to_string());
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(format!("duplicate stepId: {}", step.step_id));
            }
            if step.timeout_ms == 0 {
                return Err(format!("step {} must have a positive timeoutMs", step.step_id));
            }
            if step.retry_policy.max_attempts < 1 {
                return Err(format!("step {} must allow at least one attempt", step.step_id));
            }
            if step.retry_policy.multiplier <= 0.0 {
                return Err(format!("step {} multiplier must be positive", step.step_id));
            }
            if !(0.0..=1.0).contains(&step.retry_policy.jitter) {
                return Err(format!("step {} jitter must be within [0, 1]", step.step_id));
            }
        }
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// The step scheduled after `step_id`, if any.
    pub fn next_step_after(&self, step_id: &str) -> Option<&StepDefinition> {
        let index = self.steps.iter().position(|step| step.step_id == step_id)?;
        self.steps.get(index + 1)
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }
}

impl WorkflowDefinition {
    /// Register (or replace) a definition version.
    pub async fn upsert(
        pool: &PgPool,
        spec: &WorkflowSpec,
    ) -> Result<WorkflowDefinition, sqlx::Error> {
        spec.validate()
            .map_err(|reason| sqlx::Error::Protocol(format!("invalid definition: {reason}")))?;

        let document = serde_json::to_value(spec)
            .map_err(|e| sqlx::Error::Protocol(format!("definition serialization: {e}")))?;

        sqlx::query_as::<_, WorkflowDefinition>(
            r#"
            INSERT INTO workflow_definitions (name, version, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, version) DO UPDATE SET definition = EXCLUDED.definition
            RETURNING id, name, version, definition, created_at
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.version)
        .bind(document)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_name_version(
        pool: &PgPool,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDefinition>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowDefinition>(
            r#"
            SELECT id, name, version, definition, created_at
            FROM workflow_definitions
            WHERE name = $1 AND version = $2
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(pool)
        .await
    }

    /// Most recently registered version for a workflow name.
    pub async fn find_latest(
        pool: &PgPool,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowDefinition>(
            r#"
            SELECT id, name, version, definition, created_at
            FROM workflow_definitions
            WHERE name = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(pool)
        .await
    }

    /// Parse the stored JSONB document.
    pub fn spec(&self) -> Result<WorkflowSpec, serde_json::Error> {
        serde_json::from_value(self.definition.clone())
    }
}
