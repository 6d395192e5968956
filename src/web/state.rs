//! # Web API Application State
//!
//! Shared state for the control API: the store pool, the intake, and the
//! engine metrics snapshot source.

use crate::metrics::EngineMetrics;
use crate::orchestration::intake::RunIntake;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub intake: RunIntake,
    pub metrics: Arc<EngineMetrics>,
}

impl AppState {
    pub fn new(pool: PgPool, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            intake: RunIntake::new(pool.clone()),
            pool,
            metrics,
        }
    }
}
