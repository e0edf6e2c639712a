use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::risk::RiskLevel;

/// Crisis escalation record. Append-only; at most one per user per debounce window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CrisisFlag {
    pub id: Uuid,
    pub user_id: Uuid,
    pub risk_level: RiskLevel,
    pub triggering_message_ref: String,
    pub created_at: DateTime<Utc>,
}

impl CrisisFlag {
    pub fn new(
        user_id: Uuid,
        risk_level: RiskLevel,
        triggering_message_ref: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        CrisisFlag {
            id: Uuid::now_v7(),
            user_id,
            risk_level,
            triggering_message_ref: triggering_message_ref.into(),
            created_at,
        }
    }
}

/// A qualifying message that fell inside an open flag's debounce window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CrisisOccurrence {
    pub flag_id: Uuid,
    pub user_id: Uuid,
    pub risk_level: RiskLevel,
    pub message_ref: String,
    pub occurred_at: DateTime<Utc>,
}
