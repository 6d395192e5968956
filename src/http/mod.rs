//! # HTTP Action Execution
//!
//! Downstream action invocation with per-request timeout and outcome
//! classification. The executor never propagates downstream failures as
//! errors; every outcome is folded into [`HttpExecutionResult`] so the retry
//! policy can classify it.

pub mod executor;

pub use executor::HttpActionExecutor;

use crate::models::workflow_definition::HttpRequestSpec;
use async_trait::async_trait;

/// Per-invocation options supplied by the engine.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub timeout_ms: u64,
    /// Engine-injected headers (idempotency key, correlation id). These win
    /// over headers rendered from the request spec.
    pub extra_headers: Vec<(String, String)>,
}

/// Classified outcome of one action or compensation request.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutionResult {
    /// True iff the response status was 2xx.
    pub ok: bool,
    pub status_code: Option<u16>,
    /// Parsed JSON when the response declares `application/json`, otherwise
    /// the raw text; `None` for empty bodies.
    pub body: Option<serde_json::Value>,
    pub duration_ms: u64,
    /// The per-request timeout fired.
    pub timed_out: bool,
    /// A transport-level failure that was not a timeout.
    pub network_error: bool,
    pub error_message: Option<String>,
}

/// Seam between the engine and the HTTP client, so tests can substitute a
/// scripted executor.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &HttpRequestSpec,
        options: &ExecutionOptions,
    ) -> HttpExecutionResult;
}
