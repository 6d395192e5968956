//! # Outbox Message Model
//!
//! Row type for the `outbox` table. Claim, ack, and requeue live in
//! [`crate::messaging::outbox_client`].

use crate::messaging::message::OutboxMessageType;
use crate::models::states::OutboxStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub run_id: Uuid,
    pub message_type: OutboxMessageType,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
