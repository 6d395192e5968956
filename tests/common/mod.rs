//! Shared helpers for engine integration tests.
//!
//! The suite needs a Postgres database; tests skip themselves when
//! `DATABASE_URL` is not set. A scripted in-process HTTP server stands in
//! for the downstream services.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::{Json, Router};
use saga_core::config::EngineConfig;
use saga_core::database::DatabaseMigrations;
use saga_core::http::HttpActionExecutor;
use saga_core::messaging::outbox_client::OutboxClient;
use saga_core::metrics::EngineMetrics;
use saga_core::models::states::RunStatus;
use saga_core::models::workflow_definition::{WorkflowDefinition, WorkflowSpec};
use saga_core::models::workflow_run::WorkflowRun;
use saga_core::orchestration::{CompensationScheduler, OutboxPoller, RunIntake, StepExecutor};
use serde_json::json;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique name for test data.
pub fn unique_name(prefix: &str) -> String {
    let random: u32 = fastrand::u32(..);
    format!("{prefix}-{random}")
}

/// Pool against the test database, or `None` (skip) when no database is
/// configured.
pub async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping: DATABASE_URL not set");
        return None;
    };
    let pool = PgPool::connect(&url).await.expect("connect test database");
    DatabaseMigrations::run_all(&pool)
        .await
        .expect("ensure schema");
    Some(pool)
}

/// One engine worker wired against the given pool, with a short poll
/// interval so tests can drive ticks directly.
pub struct TestEngine {
    pub poller: OutboxPoller,
    pub intake: RunIntake,
    pub outbox: OutboxClient,
    pub metrics: Arc<EngineMetrics>,
}

pub fn build_engine(pool: &PgPool, worker_id: &str) -> TestEngine {
    let config = EngineConfig {
        database_url: String::new(),
        worker_id: worker_id.to_string(),
        poll_interval_ms: 50,
        lease_ttl_ms: 30_000,
        bind_addr: String::new(),
    };
    let metrics = Arc::new(EngineMetrics::new());
    let action_executor = Arc::new(HttpActionExecutor::new());
    let poller = OutboxPoller::new(
        &config,
        OutboxClient::new(pool.clone()),
        StepExecutor::new(pool.clone(), action_executor.clone(), metrics.clone()),
        CompensationScheduler::new(pool.clone(), action_executor, metrics.clone()),
        metrics.clone(),
    );

    TestEngine {
        poller,
        intake: RunIntake::new(pool.clone()),
        outbox: OutboxClient::new(pool.clone()),
        metrics,
    }
}

/// Tick the poller until the run settles (or fail the test).
pub async fn drive_until_settled(engine: &TestEngine, pool: &PgPool, run_id: Uuid) -> WorkflowRun {
    for _ in 0..400 {
        engine.poller.tick().await;
        let run = WorkflowRun::find_by_id(pool, run_id)
            .await
            .expect("load run")
            .expect("run exists");
        if matches!(
            run.status,
            RunStatus::Completed | RunStatus::Compensated | RunStatus::Cancelled | RunStatus::Failed
        ) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not settle");
}

pub async fn register(pool: &PgPool, spec: &WorkflowSpec) {
    WorkflowDefinition::upsert(pool, spec)
        .await
        .expect("register definition");
}

/// Scripted response for one downstream hit.
#[derive(Debug, Clone, Copy)]
pub enum MockAction {
    Status(u16),
    /// Sleep, then answer 200.
    Slow(u64),
}

#[derive(Clone, Default)]
struct MockState {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockAction>>>>,
    hits: Arc<Mutex<HashMap<String, u32>>>,
    headers: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

/// In-process downstream service. Unscripted paths answer 200 with a JSON
/// body; scripted paths consume their queue first.
pub struct MockDownstream {
    pub base_url: String,
    state: MockState,
}

impl MockDownstream {
    pub async fn start() -> Self {
        let state = MockState::default();
        let app = Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock downstream");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn script(&self, path: &str, actions: &[MockAction]) {
        self.state
            .scripts
            .lock()
            .expect("scripts lock")
            .insert(path.to_string(), actions.iter().copied().collect());
    }

    pub fn hits(&self, path: &str) -> u32 {
        *self
            .state
            .hits
            .lock()
            .expect("hits lock")
            .get(path)
            .unwrap_or(&0)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Header value observed on the most recent hit of a path.
    pub fn last_header(&self, path: &str, header: &str) -> Option<String> {
        self.state
            .headers
            .lock()
            .expect("headers lock")
            .get(path)
            .and_then(|headers| headers.get(header))
            .cloned()
    }
}

async fn mock_handler(
    State(state): State<MockState>,
    headers: axum::http::HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    *state
        .hits
        .lock()
        .expect("hits lock")
        .entry(path.clone())
        .or_insert(0) += 1;
    state.headers.lock().expect("headers lock").insert(
        path.clone(),
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    );

    let action = state
        .scripts
        .lock()
        .expect("scripts lock")
        .get_mut(&path)
        .and_then(|queue| queue.pop_front());

    match action {
        Some(MockAction::Slow(delay_ms)) => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            (StatusCode::OK, Json(json!({"ok": true, "slow": true})))
        }
        Some(MockAction::Status(code)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"ok": status.is_success()})))
        }
        None => (StatusCode::OK, Json(json!({"ok": true}))),
    }
}

/// The three-step order workflow used across scenarios, with every action
/// and compensation pointed at the mock downstream.
pub fn order_workflow(name: &str, mock: &MockDownstream) -> WorkflowSpec {
    serde_json::from_value(json!({
        "name": name,
        "version": "1.0.0",
        "steps": [
            {
                "stepId": "charge-payment",
                "action": {
                    "method": "POST",
                    "url": mock.url("/payments/charge"),
                    "body": { "orderId": "{{input.orderId}}", "amount": "{{input.amount}}" }
                },
                "compensation": {
                    "method": "POST",
                    "url": mock.url("/payments/refund"),
                    "body": { "orderId": "{{input.orderId}}" }
                },
                "timeoutMs": 2000,
                "retryPolicy": {
                    "maxAttempts": 3,
                    "initialDelayMs": 10,
                    "maxDelayMs": 100,
                    "multiplier": 2.0,
                    "jitter": 0.0
                }
            },
            {
                "stepId": "reserve-inventory",
                "action": {
                    "method": "POST",
                    "url": mock.url("/inventory/reserve"),
                    "body": { "sku": "{{input.sku}}" }
                },
                "timeoutMs": 2000,
                "retryPolicy": {
                    "maxAttempts": 3,
                    "initialDelayMs": 10,
                    "maxDelayMs": 100,
                    "multiplier": 2.0,
                    "jitter": 0.0
                }
            },
            {
                "stepId": "send-confirmation-email",
                "action": {
                    "method": "POST",
                    "url": mock.url("/emails/confirmation"),
                    "body": { "email": "{{input.email}}" }
                },
                "timeoutMs": 2000,
                "retryPolicy": {
                    "maxAttempts": 2,
                    "initialDelayMs": 10,
                    "maxDelayMs": 100,
                    "multiplier": 2.0,
                    "jitter": 0.0
                }
            }
        ]
    }))
    .expect("order workflow parses")
}
