pub mod config;
pub mod database;
pub mod error;
pub mod http;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod retry;
pub mod templating;
pub mod web;

pub use config::EngineConfig;
pub use error::{Result, SagaError};
