//! # Outbox Message Payloads
//!
//! Wire formats for the two outbox message types. The JSON layout (camelCase
//! keys, upper-case literals) is part of the persisted contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outbox message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxMessageType {
    ExecuteStep,
    ExecuteCompensation,
}

impl fmt::Display for OutboxMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecuteStep => write!(f, "EXECUTE_STEP"),
            Self::ExecuteCompensation => write!(f, "EXECUTE_COMPENSATION"),
        }
    }
}

impl std::str::FromStr for OutboxMessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTE_STEP" => Ok(Self::ExecuteStep),
            "EXECUTE_COMPENSATION" => Ok(Self::ExecuteCompensation),
            _ => Err(format!("Invalid outbox message type: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for OutboxMessageType {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for OutboxMessageType {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let text = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
        text.parse::<OutboxMessageType>().map_err(Into::into)
    }
}

/// What scheduled an EXECUTE_STEP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledBy {
    Start,
    NextStep,
    Retry,
    ManualRetry,
}

/// Why a compensation sweep was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationReason {
    StepFailure,
    Cancel,
}

/// Payload of an EXECUTE_STEP message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    pub run_id: Uuid,
    pub step_id: String,
    pub scheduled_by: ScheduledBy,
}

/// Payload of an EXECUTE_COMPENSATION message. The queue is head-first: the
/// first element is the next step to compensate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationPayload {
    pub run_id: Uuid,
    pub queue: Vec<String>,
    pub reason: CompensationReason,
}

impl StepPayload {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

impl CompensationPayload {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
