//! Run, step, and outbox state definitions.
//!
//! The literal status strings are part of the persisted contract and of the
//! control API responses, so they serialize exactly as stored.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl RunStatus {
    /// Terminal states the engine skips work for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Cancelled)
    }

    /// Absorbing states that no transition may ever overwrite.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }

    /// States from which a step execution may (re)start the run.
    pub fn allows_execution(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Compensating => write!(f, "COMPENSATING"),
            Self::Compensated => write!(f, "COMPENSATED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "COMPENSATING" => Ok(Self::Compensating),
            "COMPENSATED" => Ok(Self::Compensated),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

/// Per-step action states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    Skipped,
}

impl StepStatus {
    /// States under which a re-delivered EXECUTE_STEP must not run again.
    pub fn blocks_execution(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Compensated | Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Compensated => write!(f, "COMPENSATED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "COMPENSATED" => Ok(Self::Compensated),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}

/// Per-step compensation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    #[default]
    Pending,
    Running,
    Compensated,
    Failed,
    Skipped,
}

impl CompensationStatus {
    /// States under which a re-delivered queue head must be passed over.
    pub fn blocks_compensation(&self) -> bool {
        matches!(self, Self::Compensated | Self::Skipped | Self::Running)
    }

    /// Whether this state counts toward the run reaching COMPENSATED.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Compensated | Self::Skipped)
    }
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Compensated => write!(f, "COMPENSATED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl std::str::FromStr for CompensationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPENSATED" => Ok(Self::Compensated),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Invalid compensation status: {s}")),
        }
    }
}

/// Outbox row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    InFlight,
    Done,
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_FLIGHT" => Ok(Self::InFlight),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid outbox status: {s}")),
        }
    }
}

/// Whether an attempt row records an action or a compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptType {
    Action,
    Compensation,
}

impl fmt::Display for AttemptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action => write!(f, "ACTION"),
            Self::Compensation => write!(f, "COMPENSATION"),
        }
    }
}

impl std::str::FromStr for AttemptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTION" => Ok(Self::Action),
            "COMPENSATION" => Ok(Self::Compensation),
            _ => Err(format!("Invalid attempt type: {s}")),
        }
    }
}

/// Outcome recorded on an attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    Fail,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid attempt outcome: {s}")),
        }
    }
}

// The status enums are stored as TEXT; decode them straight from rows.
macro_rules! pg_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl sqlx::Type<sqlx::Postgres> for $ty {
                fn type_info() -> sqlx::postgres::PgTypeInfo {
                    <&str as sqlx::Type<sqlx::Postgres>>::type_info()
                }

                fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                    <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
                }
            }

            impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
                fn decode(
                    value: sqlx::postgres::PgValueRef<'r>,
                ) -> Result<Self, sqlx::error::BoxDynError> {
                    let text = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                    text.parse::<$ty>().map_err(Into::into)
                }
            }
        )+
    };
}

pg_text_enum!(
    RunStatus,
    StepStatus,
    CompensationStatus,
    OutboxStatus,
    AttemptType,
    AttemptOutcome,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminal_check() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Compensated.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Compensating.is_terminal());
        assert!(!RunStatus::Failed.is_terminal());
    }

    #[test]
    fn run_status_absorbing_is_subset_of_terminal() {
        assert!(RunStatus::Completed.is_absorbing());
        assert!(RunStatus::Compensated.is_absorbing());
        assert!(!RunStatus::Cancelled.is_absorbing());
    }

    #[test]
    fn step_status_reentrancy_guard() {
        assert!(StepStatus::Succeeded.blocks_execution());
        assert!(StepStatus::Compensated.blocks_execution());
        assert!(StepStatus::Running.blocks_execution());
        assert!(!StepStatus::Pending.blocks_execution());
        assert!(!StepStatus::Failed.blocks_execution());
    }

    #[test]
    fn compensation_status_guards() {
        assert!(CompensationStatus::Running.blocks_compensation());
        assert!(CompensationStatus::Skipped.blocks_compensation());
        assert!(!CompensationStatus::Failed.blocks_compensation());
        assert!(CompensationStatus::Skipped.is_settled());
        assert!(CompensationStatus::Compensated.is_settled());
        assert!(!CompensationStatus::Running.is_settled());
    }

    #[test]
    fn state_string_round_trip() {
        assert_eq!(RunStatus::Compensating.to_string(), "COMPENSATING");
        assert_eq!("COMPENSATING".parse::<RunStatus>().unwrap(), RunStatus::Compensating);
        assert_eq!(OutboxStatus::InFlight.to_string(), "IN_FLIGHT");
        assert_eq!("IN_FLIGHT".parse::<OutboxStatus>().unwrap(), OutboxStatus::InFlight);
        assert_eq!(AttemptType::Compensation.to_string(), "COMPENSATION");
        assert!("in_flight".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn state_serde_matches_storage_literals() {
        assert_eq!(serde_json::to_string(&RunStatus::Running).unwrap(), "\"RUNNING\"");
        assert_eq!(
            serde_json::from_str::<StepStatus>("\"SUCCEEDED\"").unwrap(),
            StepStatus::Succeeded
        );
    }
}
