use crate::error::{Result, SagaError};
use std::time::Duration;

/// Engine worker and server configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    /// Identifies this worker in outbox lease columns and logs.
    pub worker_id: String,
    /// Idle interval between outbox polling ticks.
    pub poll_interval_ms: u64,
    /// Lease TTL after which an IN_FLIGHT outbox row may be reclaimed.
    pub lease_ttl_ms: u64,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/saga_development".to_string(),
            worker_id: default_worker_id(),
            poll_interval_ms: 500,
            lease_ttl_ms: 30_000,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(worker_id) = std::env::var("ENGINE_WORKER_ID") {
            config.worker_id = worker_id;
        }

        if let Ok(poll_ms) = std::env::var("ENGINE_POLL_INTERVAL_MS") {
            config.poll_interval_ms = poll_ms.parse().map_err(|e| {
                SagaError::ConfigurationError(format!("Invalid ENGINE_POLL_INTERVAL_MS: {e}"))
            })?;
        }

        if let Ok(lease_ttl) = std::env::var("ENGINE_LEASE_TTL_MS") {
            config.lease_ttl_ms = lease_ttl.parse().map_err(|e| {
                SagaError::ConfigurationError(format!("Invalid ENGINE_LEASE_TTL_MS: {e}"))
            })?;
        }

        if let Ok(bind_addr) = std::env::var("ENGINE_BIND_ADDR") {
            config.bind_addr = bind_addr;
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}
