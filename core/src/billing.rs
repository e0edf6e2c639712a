use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

/// Authoritative subscription status of a user. Stored lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Parse a stored value. Unknown values read as `Incomplete`, which is not premium.
    pub fn from_db_value(value: &str) -> Self {
        Self::from_provider_status(value).unwrap_or(SubscriptionStatus::Incomplete)
    }

    /// Map a payment-provider status string. `None` means the value is not recognized.
    pub fn from_provider_status(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }

    pub fn is_premium(self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

/// Processing state of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Processed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Processed => "processed",
            LedgerStatus::Failed => "failed",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value {
            "processed" => LedgerStatus::Processed,
            "failed" => LedgerStatus::Failed,
            _ => LedgerStatus::Pending,
        }
    }
}

/// Raw billing webhook body as delivered by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookEnvelope {
    /// Provider event id, used as the idempotency key
    pub id: String,
    /// Provider event type (e.g. "customer.subscription.updated")
    #[serde(rename = "type")]
    pub kind: String,
    /// Event object; must carry the subject user and (for most kinds) a status
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Billing state change accepted into the ledger. Immutable once accepted.
///
/// `subject_user_id` and `new_status` are optional so that malformed events can
/// still be recorded (and rejected) under their id.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub kind: String,
    pub subject_user_id: Option<Uuid>,
    pub new_status: Option<String>,
    pub received_at: DateTime<Utc>,
    pub payload_hash: String,
}

/// Event kinds the ledger knows how to apply, with the status they imply
/// when the payload does not carry one.
const KNOWN_KINDS: &[(&str, Option<&str>)] = &[
    ("checkout.session.completed", Some("active")),
    ("customer.subscription.created", None),
    ("customer.subscription.updated", None),
    ("customer.subscription.deleted", Some("canceled")),
    ("invoice.payment_succeeded", Some("active")),
    ("invoice.payment_failed", Some("past_due")),
];

/// Why an event can never be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("event id must not be empty")]
    MissingId,
    #[error("unknown event type '{0}'")]
    UnknownKind(String),
    #[error("event payload does not name a subject user")]
    MissingSubject,
    #[error("event does not carry a subscription status")]
    MissingStatus,
    #[error("unrecognized subscription status '{0}'")]
    UnrecognizedStatus(String),
}

/// The single effect a valid billing event has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
}

impl BillingEvent {
    /// Project a webhook body into a ledger event. Never fails: problems with
    /// the payload surface later through [`BillingEvent::transition`].
    pub fn from_envelope(envelope: &WebhookEnvelope, received_at: DateTime<Utc>) -> Self {
        let payload = &envelope.payload;
        let subject_user_id = ["user_id", "client_reference_id"]
            .iter()
            .filter_map(|key| payload.get(*key))
            .chain(payload.pointer("/metadata/user_id"))
            .filter_map(|value| value.as_str())
            .find_map(|raw| Uuid::parse_str(raw.trim()).ok());

        let implied = KNOWN_KINDS
            .iter()
            .find(|(kind, _)| *kind == envelope.kind)
            .and_then(|(_, implied)| *implied);
        let new_status = payload
            .get("status")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .or_else(|| implied.map(str::to_string));

        BillingEvent {
            id: envelope.id.trim().to_string(),
            kind: envelope.kind.clone(),
            subject_user_id,
            new_status,
            received_at,
            payload_hash: payload_hash(&envelope.kind, payload),
        }
    }

    /// Validate the event and return the status write it stands for.
    pub fn transition(&self) -> Result<StatusTransition, Rejection> {
        if self.id.is_empty() {
            return Err(Rejection::MissingId);
        }
        if !KNOWN_KINDS.iter().any(|(kind, _)| *kind == self.kind) {
            return Err(Rejection::UnknownKind(self.kind.clone()));
        }
        let user_id = self.subject_user_id.ok_or(Rejection::MissingSubject)?;
        let raw = self.new_status.as_deref().ok_or(Rejection::MissingStatus)?;
        let status = SubscriptionStatus::from_provider_status(raw)
            .ok_or_else(|| Rejection::UnrecognizedStatus(raw.to_string()))?;
        Ok(StatusTransition { user_id, status })
    }
}

/// SHA-256 over the event type and its payload. `serde_json` maps are sorted,
/// so key order in the delivered body does not change the hash.
pub fn payload_hash(kind: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Persisted projection of a billing event.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub id: String,
    pub kind: String,
    pub subject_user_id: Option<Uuid>,
    pub status: LedgerStatus,
    pub attempts: i32,
    /// Failed records with `permanent` set are never retried.
    pub permanent: bool,
    pub failure_reason: Option<String>,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn pending(event: &BillingEvent) -> Self {
        LedgerRecord {
            id: event.id.clone(),
            kind: event.kind.clone(),
            subject_user_id: event.subject_user_id,
            status: LedgerStatus::Pending,
            attempts: 0,
            permanent: false,
            failure_reason: None,
            payload_hash: event.payload_hash.clone(),
            created_at: event.received_at,
            updated_at: event.received_at,
        }
    }

    /// Terminal records are never processed again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            LedgerStatus::Processed => true,
            LedgerStatus::Failed => self.permanent,
            LedgerStatus::Pending => false,
        }
    }
}

/// Result of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// This call applied the event.
    Accepted,
    /// The id already reached a terminal state; nothing was applied.
    AlreadyProcessed { status: LedgerStatus },
    /// The event is malformed or unknown; recorded but not applied.
    Rejected { reason: String },
    /// The id was seen before with a different payload.
    Conflict,
}

impl IngestOutcome {
    /// Label used in the webhook response body.
    pub fn response_label(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted => "accepted",
            IngestOutcome::AlreadyProcessed { .. } => "duplicate",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::Conflict => "conflict",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, payload: serde_json::Value) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_1".to_string(),
            kind: kind.to_string(),
            payload,
        }
    }

    #[test]
    fn provider_status_mapping_matches_billing_semantics() {
        assert_eq!(
            SubscriptionStatus::from_provider_status("trialing"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            SubscriptionStatus::from_provider_status("unpaid"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            SubscriptionStatus::from_provider_status("incomplete_expired"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(SubscriptionStatus::from_provider_status("paused"), None);
        assert!(SubscriptionStatus::Active.is_premium());
        assert!(!SubscriptionStatus::PastDue.is_premium());
        assert_eq!(SubscriptionStatus::from_db_value("garbage"), SubscriptionStatus::Incomplete);
    }

    #[test]
    fn subscription_updated_uses_payload_status() {
        let user = Uuid::now_v7();
        let event = BillingEvent::from_envelope(
            &envelope(
                "customer.subscription.updated",
                json!({"metadata": {"user_id": user.to_string()}, "status": "past_due"}),
            ),
            Utc::now(),
        );
        assert_eq!(
            event.transition(),
            Ok(StatusTransition {
                user_id: user,
                status: SubscriptionStatus::PastDue
            })
        );
    }

    #[test]
    fn deleted_subscription_implies_canceled() {
        let user = Uuid::now_v7();
        let event = BillingEvent::from_envelope(
            &envelope(
                "customer.subscription.deleted",
                json!({"user_id": user.to_string()}),
            ),
            Utc::now(),
        );
        assert_eq!(event.new_status.as_deref(), Some("canceled"));
        assert_eq!(
            event.transition().map(|t| t.status),
            Ok(SubscriptionStatus::Canceled)
        );
    }

    #[test]
    fn malformed_events_are_rejected_with_reason() {
        let now = Utc::now();
        let unknown = BillingEvent::from_envelope(&envelope("invoice.created", json!({})), now);
        assert_eq!(
            unknown.transition(),
            Err(Rejection::UnknownKind("invoice.created".to_string()))
        );

        let no_user = BillingEvent::from_envelope(
            &envelope("customer.subscription.updated", json!({"status": "active"})),
            now,
        );
        assert_eq!(no_user.transition(), Err(Rejection::MissingSubject));

        let bad_status = BillingEvent::from_envelope(
            &envelope(
                "customer.subscription.updated",
                json!({"user_id": Uuid::now_v7().to_string(), "status": "paused"}),
            ),
            now,
        );
        assert_eq!(
            bad_status.transition(),
            Err(Rejection::UnrecognizedStatus("paused".to_string()))
        );
    }

    #[test]
    fn payload_hash_ignores_key_order_but_not_content() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let c: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":3}"#).unwrap();
        assert_eq!(payload_hash("k", &a), payload_hash("k", &b));
        assert_ne!(payload_hash("k", &a), payload_hash("k", &c));
        assert_ne!(payload_hash("k", &a), payload_hash("j", &a));
    }

    #[test]
    fn terminal_records_depend_on_permanence() {
        let event = BillingEvent::from_envelope(
            &envelope("invoice.payment_failed", json!({})),
            Utc::now(),
        );
        let mut record = LedgerRecord::pending(&event);
        assert!(!record.is_terminal());
        record.status = LedgerStatus::Failed;
        assert!(!record.is_terminal());
        record.permanent = true;
        assert!(record.is_terminal());
        record.status = LedgerStatus::Processed;
        assert!(record.is_terminal());
    }
}
