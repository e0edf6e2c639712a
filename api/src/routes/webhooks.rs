use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use mindease_core::billing::{BillingEvent, IngestOutcome, WebhookEnvelope};
use mindease_core::error::{ApiError, codes};

use crate::error::AppError;
use crate::extract::invalid_body;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "billing-signature";
/// Maximum age (and clock skew) of a signed delivery.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/billing/webhook", post(receive_billing_webhook))
}

/// Response for POST /v1/billing/webhook
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WebhookAck {
    /// "accepted", "duplicate" or "rejected"
    pub result: String,
    /// Machine code for a rejected event ("webhook_rejected")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Why a rejected event will never be applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing Billing-Signature header")]
    Missing,
    #[error("Billing-Signature header must look like 't=<unix>,v1=<hex>'")]
    Malformed,
    #[error("signature timestamp is outside the accepted window")]
    Stale,
    #[error("signature does not match the request body")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::WebhookSignature {
            message: err.to_string(),
        }
    }
}

/// Check `t=<unix>,v1=<hex>` against HMAC-SHA256 of `"{t}.{body}"`.
/// Any of several `v1` entries may match (secret rotation).
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Receive a billing event from the payment provider
///
/// Each event id is applied at most once. Redeliveries of an already
/// processed or rejected event are acknowledged with `duplicate`. A 500
/// means the event stays retryable and the provider should redeliver.
#[utoipa::path(
    post,
    path = "/v1/billing/webhook",
    request_body = WebhookEnvelope,
    responses(
        (status = 200, description = "Event accepted, duplicate, or permanently rejected", body = WebhookAck),
        (status = 400, description = "Missing/invalid signature, unparseable body, or blank event id", body = ApiError),
        (status = 409, description = "Event id reused with a different payload", body = ApiError),
        (status = 500, description = "Transient failure; redeliver later", body = ApiError)
    ),
    tag = "billing"
)]
pub async fn receive_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(SignatureError::Missing)?;
        verify_signature(secret, header, &body, Utc::now().timestamp()).inspect_err(|err| {
            tracing::warn!(error = %err, "billing webhook signature rejected");
        })?;
    }

    let envelope: WebhookEnvelope =
        serde_json::from_slice(&body).map_err(|err| invalid_body(&err.to_string()))?;
    let event = BillingEvent::from_envelope(&envelope, Utc::now());
    if event.id.is_empty() {
        return Err(AppError::Validation {
            message: "event id must not be empty".to_string(),
            field: Some("id".to_string()),
            received: Some(serde_json::Value::String(envelope.id)),
            docs_hint: None,
        });
    }

    let outcome = state.ledger.ingest(&event).await?;
    let result = outcome.response_label().to_string();
    match outcome {
        IngestOutcome::Conflict => Err(AppError::WebhookConflict { event_id: event.id }),
        IngestOutcome::Rejected { reason } => Ok(Json(WebhookAck {
            result,
            code: Some(codes::WEBHOOK_REJECTED.to_string()),
            reason: Some(reason),
        })),
        IngestOutcome::Accepted | IngestOutcome::AlreadyProcessed { .. } => Ok(Json(WebhookAck {
            result,
            code: None,
            reason: None,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use std::sync::atomic::Ordering;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use mindease_core::billing::SubscriptionStatus;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::EngineConfig;
    use crate::entitlement::tests::FakeSource;
    use crate::ledger::tests::MemoryLedgerStore;
    use crate::state::tests::{test_state, test_state_with_ledger};

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_760_000_000;

    fn sign(timestamp: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac key");
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"id":"evt_1"}"#;
        assert_eq!(verify_signature(SECRET, &sign(NOW, body), body, NOW + 10), Ok(()));
    }

    #[test]
    fn rotated_secret_matches_any_v1_entry() {
        let body = br#"{"id":"evt_1"}"#;
        let header = format!("{},v1=deadbeef", sign(NOW, body));
        let reordered = header.replacen("t=", "v1=00,t=", 1);
        assert_eq!(verify_signature(SECRET, &reordered, body, NOW), Ok(()));
    }

    #[test]
    fn tampered_body_is_a_mismatch() {
        let header = sign(NOW, br#"{"id":"evt_1"}"#);
        assert_eq!(
            verify_signature(SECRET, &header, br#"{"id":"evt_2"}"#, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn old_delivery_is_stale() {
        let body = b"{}";
        assert_eq!(
            verify_signature(SECRET, &sign(NOW, body), body, NOW + 301),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn header_without_parts_is_malformed() {
        assert_eq!(
            verify_signature(SECRET, "v1=abc", b"{}", NOW),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, "t=123", b"{}", NOW),
            Err(SignatureError::Malformed)
        );
    }

    fn app(secret: Option<&str>) -> Router {
        let config = EngineConfig {
            webhook_secret: secret.map(str::to_string),
            ..EngineConfig::default()
        };
        let (state, _worker) = test_state(Arc::new(FakeSource::default()), Vec::new(), config);
        router().with_state(state)
    }

    fn post_webhook(body: &'static str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/billing/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body)).expect("request should build")
    }

    #[tokio::test]
    async fn unsigned_delivery_is_refused_when_a_secret_is_configured() {
        let response = app(Some(SECRET))
            .oneshot(post_webhook(r#"{"id":"evt_1","type":"invoice.payment_failed"}"#, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn badly_signed_delivery_is_refused() {
        let signature = format!("t={},v1=00ff", Utc::now().timestamp());
        let response = app(Some(SECRET))
            .oneshot(post_webhook(r#"{"id":"evt_1","type":"x"}"#, Some(signature)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unparseable_envelope_is_a_validation_error() {
        let response = app(None)
            .oneshot(post_webhook(r#"{"payload":{}}"#, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    struct LedgerHarness {
        app: Router,
        source: Arc<FakeSource>,
        failing_writes: Arc<std::sync::atomic::AtomicUsize>,
    }

    fn ledger_app() -> LedgerHarness {
        let source = Arc::new(FakeSource::default());
        let store = MemoryLedgerStore::new(source.clone());
        let failing_writes = store.failing_writes.clone();
        let (state, _worker) = test_state_with_ledger(
            source.clone(),
            Vec::new(),
            EngineConfig::default(),
            store,
        );
        LedgerHarness {
            app: router().with_state(state),
            source,
            failing_writes,
        }
    }

    fn post_json(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/billing/webhook")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request should build")
    }

    fn activation(id: &str, user: Uuid, status: &str) -> String {
        serde_json::json!({
            "id": id,
            "type": "customer.subscription.updated",
            "payload": {"user_id": user.to_string(), "status": status},
        })
        .to_string()
    }

    async fn send(app: &Router, body: String) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(post_json(body)).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        (status, serde_json::from_slice(&bytes).expect("body should be json"))
    }

    #[tokio::test]
    async fn first_delivery_is_accepted_and_redelivery_is_a_duplicate() {
        let h = ledger_app();
        let user = Uuid::now_v7();

        let (status, body) = send(&h.app, activation("evt_1", user, "active")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "accepted");
        assert!(body.get("code").is_none());
        assert_eq!(
            h.source.statuses.lock().expect("statuses").get(&user).copied(),
            Some(SubscriptionStatus::Active)
        );

        let (status, body) = send(&h.app, activation("evt_1", user, "active")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "duplicate");
    }

    #[tokio::test]
    async fn unknown_event_is_acknowledged_as_rejected() {
        let h = ledger_app();
        let body = serde_json::json!({"id": "evt_2", "type": "customer.created", "payload": {}});

        let (status, body) = send(&h.app, body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "rejected");
        assert_eq!(body["code"], codes::WEBHOOK_REJECTED);
        assert!(body["reason"].as_str().is_some_and(|r| r.contains("customer.created")));
    }

    #[tokio::test]
    async fn reused_id_with_another_payload_is_a_conflict() {
        let h = ledger_app();
        let user = Uuid::now_v7();
        send(&h.app, activation("evt_3", user, "active")).await;

        let (status, body) = send(&h.app, activation("evt_3", user, "canceled")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], codes::WEBHOOK_CONFLICT);
    }

    #[tokio::test]
    async fn failed_processing_asks_for_redelivery() {
        let h = ledger_app();
        let user = Uuid::now_v7();
        h.failing_writes.store(1, Ordering::SeqCst);

        let (status, body) = send(&h.app, activation("evt_4", user, "active")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], codes::INTERNAL_ERROR);

        let (status, body) = send(&h.app, activation("evt_4", user, "active")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "accepted");
    }

    #[tokio::test]
    async fn blank_event_id_is_a_validation_error() {
        let h = ledger_app();
        let user = Uuid::now_v7();

        for status in ["active", "canceled"] {
            let (code, body) = send(&h.app, activation("  ", user, status)).await;
            assert_eq!(code, StatusCode::BAD_REQUEST);
            assert_eq!(body["field"], "id");
        }
        assert!(h.source.statuses.lock().expect("statuses").is_empty());
    }
}
