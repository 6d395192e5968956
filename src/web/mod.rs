//! # Control API
//!
//! HTTP surface for starting, inspecting, retrying, and cancelling runs.
//! Thin layer over the intake and the run/step models; all engine decisions
//! stay in `orchestration`.

pub mod errors;
pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use state::AppState;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows/{name}/start", post(handlers::runs::start_workflow))
        .route("/v1/runs/{run_id}", get(handlers::runs::get_run))
        .route(
            "/v1/runs/{run_id}/steps/{step_id}/retry",
            post(handlers::runs::retry_step),
        )
        .route("/v1/runs/{run_id}/cancel", post(handlers::runs::cancel_run))
        .route("/v1/health", get(handlers::health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
