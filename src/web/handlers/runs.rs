//! # Run Handlers
//!
//! Start, inspect, retry, and cancel endpoints. Request validation happens
//! here; state transitions are delegated to the intake.

use crate::models::run_step::RunStep;
use crate::models::states::{CompensationStatus, RunStatus, StepStatus};
use crate::models::workflow_definition::WorkflowDefinition;
use crate::models::workflow_run::WorkflowRun;
use crate::orchestration::intake::CancelOutcome;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub version: Option<String>,
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,
    #[serde(default = "empty_object")]
    pub context: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// POST /v1/workflows/{name}/start
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    if name.is_empty() {
        return Err(ApiError::bad_request("workflow name cannot be empty"));
    }
    if !request.input.is_object() {
        return Err(ApiError::bad_request("input must be a JSON object"));
    }
    if !request.context.is_object() {
        return Err(ApiError::bad_request("context must be a JSON object"));
    }

    let run = state
        .intake
        .start_run(
            &name,
            request.version.as_deref(),
            request.input,
            request.context,
        )
        .await?;

    info!(run_id = %run.run_id, workflow = %name, "run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id: run.run_id,
            status: run.status,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
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
    pub steps: Vec<StepView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
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
}

/// GET /v1/runs/{run_id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunView>> {
    let run = WorkflowRun::find_by_id(&state.pool, run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("run_not_found", format!("run {run_id} not found")))?;

    let mut steps = RunStep::list_for_run(&state.pool, run_id).await?;
    sort_by_definition_order(&state, &run, &mut steps).await?;

    Ok(Json(RunView {
        run_id: run.run_id,
        workflow_name: run.workflow_name,
        workflow_version: run.workflow_version,
        status: run.status,
        input: run.input,
        context: run.context,
        error_code: run.error_code,
        error_message: run.error_message,
        created_at: run.created_at,
        updated_at: run.updated_at,
        steps: steps.into_iter().map(step_view).collect(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub run_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
}

/// POST /v1/runs/{run_id}/steps/{step_id}/retry
pub async fn retry_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
) -> ApiResult<(StatusCode, Json<RetryResponse>)> {
    state.intake.retry_step(run_id, &step_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            run_id,
            step_id,
            status: StepStatus::Pending,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub compensate: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// POST /v1/runs/{run_id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let compensate = body
        .map(|Json(request)| request.compensate.unwrap_or(true))
        .unwrap_or(true);

    let outcome = state.intake.cancel_run(run_id, compensate).await?;
    let status = match outcome {
        CancelOutcome::Cancelled => RunStatus::Cancelled,
        CancelOutcome::Compensating => RunStatus::Compensating,
    };

    Ok((StatusCode::ACCEPTED, Json(CancelResponse { run_id, status })))
}

fn step_view(step: RunStep) -> StepView {
    StepView {
        step_id: step.step_id,
        status: step.status,
        attempts: step.attempts,
        last_error: step.last_error,
        started_at: step.started_at,
        ended_at: step.ended_at,
        output: step.output,
        compensation_status: step.compensation_status,
        compensation_attempts: step.compensation_attempts,
        compensation_error: step.compensation_error,
    }
}

/// Order the step rows as the definition declares them; rows for steps no
/// longer present in the definition sort last.
async fn sort_by_definition_order(
    state: &AppState,
    run: &WorkflowRun,
    steps: &mut [RunStep],
) -> ApiResult<()> {
    let Some(definition) = WorkflowDefinition::find_by_name_version(
        &state.pool,
        &run.workflow_name,
        &run.workflow_version,
    )
    .await?
    else {
        return Ok(());
    };
    let Ok(spec) = definition.spec() else {
        return Ok(());
    };

    let position = |step_id: &str| {
        spec.steps
            .iter()
            .position(|s| s.step_id == step_id)
            .unwrap_or(usize::MAX)
    };
    steps.sort_by_key(|step| position(&step.step_id));
    Ok(())
}
