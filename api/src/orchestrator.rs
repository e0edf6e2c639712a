use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mindease_core::chat::{
    Capability, ChatBackendResponse, ChatMeta, ChatReply, CrisisResource, SelectionStrategy,
};
use mindease_core::risk::{RiskThresholds, classify_response};
use uuid::Uuid;

use crate::backends::{BackendError, BackendRequest};
use crate::escalation::CrisisEscalator;
use crate::retry::call_with_retry;
use crate::selector::{ProviderSelector, RegisteredBackend, SelectionError, SelectionRequest};

/// One chat turn, with identity already resolved.
#[derive(Debug, Clone)]
pub struct ChatCommand {
    pub user_id: Uuid,
    pub message: String,
    pub strategy: Option<SelectionStrategy>,
    pub preferred_backend: Option<String>,
    pub capability: Capability,
    pub message_ref: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("chat backend '{backend}' failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },
}

pub struct Orchestrator {
    selector: Arc<ProviderSelector>,
    escalator: Arc<CrisisEscalator>,
    thresholds: RiskThresholds,
    backend_timeout: Duration,
    default_strategy: SelectionStrategy,
    crisis_resources: Vec<CrisisResource>,
}

impl Orchestrator {
    pub fn new(
        selector: Arc<ProviderSelector>,
        escalator: Arc<CrisisEscalator>,
        thresholds: RiskThresholds,
        backend_timeout: Duration,
        default_strategy: SelectionStrategy,
        crisis_resources: Vec<CrisisResource>,
    ) -> Self {
        Self {
            selector,
            escalator,
            thresholds,
            backend_timeout,
            default_strategy,
            crisis_resources,
        }
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    /// Select, invoke (falling back to the alternate once), classify, escalate.
    ///
    /// Escalation is staged and queued before the reply is built. The hand-off
    /// runs on its own task, so dropping this future does not lose the crisis
    /// record.
    pub async fn handle(&self, command: ChatCommand) -> Result<ChatReply, ChatError> {
        let message = command.message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let selection = self
            .selector
            .select(&SelectionRequest {
                strategy: command.strategy.unwrap_or(self.default_strategy),
                preferred_backend: command.preferred_backend.as_deref(),
                user_id: command.user_id,
                capability: command.capability,
            })
            .await?;

        let request = BackendRequest {
            user_id: command.user_id,
            message,
        };

        let (served_by, response, degraded) =
            match self.invoke(&selection.primary, &request).await {
                Ok(response) => (selection.primary.clone(), response, selection.degraded),
                Err(primary_err) => {
                    let alternate = selection.alternate.filter(|b| b.try_admit());
                    let Some(alternate) = alternate else {
                        return Err(ChatError::Backend {
                            backend: selection.primary.name().to_string(),
                            source: primary_err,
                        });
                    };
                    tracing::warn!(
                        user_id = %command.user_id,
                        failed_backend = selection.primary.name(),
                        fallback_backend = alternate.name(),
                        error = %primary_err,
                        "falling back to alternate chat backend"
                    );
                    match self.invoke(&alternate, &request).await {
                        Ok(response) => (alternate, response, true),
                        Err(err) => {
                            return Err(ChatError::Backend {
                                backend: alternate.name().to_string(),
                                source: err,
                            });
                        }
                    }
                }
            };

        let level = classify_response(&response, &self.thresholds);
        let message_ref = command
            .message_ref
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        self.escalator
            .maybe_escalate(command.user_id, &message_ref, level, Utc::now())
            .await;

        tracing::info!(
            user_id = %command.user_id,
            backend = served_by.name(),
            degraded,
            risk_level = level.as_str(),
            "chat turn completed"
        );

        let ChatBackendResponse {
            reply,
            safety_label,
            risk_score,
            citations,
            model_used,
        } = response;
        let safety_banner = level.triggers_escalation();

        Ok(ChatReply {
            reply,
            meta: ChatMeta {
                safety: safety_label.unwrap_or_else(|| "unknown".to_string()),
                risk_score,
                risk_level: level,
                citations,
                model_used,
                backend: served_by.name().to_string(),
                degraded,
            },
            safety_banner,
            crisis_resources: if safety_banner {
                self.crisis_resources.clone()
            } else {
                Vec::new()
            },
        })
    }

    /// Timeout plus one retry; the outcome feeds the backend's breaker.
    async fn invoke(
        &self,
        backend: &RegisteredBackend,
        request: &BackendRequest<'_>,
    ) -> Result<ChatBackendResponse, BackendError> {
        let result = call_with_retry(backend.name(), self.backend_timeout, || {
            backend.backend.chat(request)
        })
        .await
        .map_err(BackendError::from);

        match &result {
            Ok(_) => backend.breaker.record_success(),
            Err(err) => {
                if backend.breaker.record_failure() {
                    tracing::warn!(
                        backend = backend.name(),
                        error = %err,
                        "circuit opened for chat backend"
                    );
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindease_core::billing::SubscriptionStatus;
    use mindease_core::chat::BackendTier;
    use mindease_core::risk::RiskLevel;
    use std::sync::atomic::Ordering;

    use crate::alerts::tests::RecordingAlerts;
    use crate::entitlement::tests::FakeSource;
    use crate::escalation::tests::{FlakySink, MemoryOutbox};
    use crate::escalation::{EscalationJob, EscalationWorker, RetryPolicy};
    use crate::selector::tests::{Behavior, FakeBackend, entitlements, registered};

    struct Harness {
        orchestrator: Orchestrator,
        worker: EscalationWorker,
        cloud: Arc<FakeBackend>,
        local: Arc<FakeBackend>,
        source: Arc<FakeSource>,
    }

    fn harness() -> Harness {
        let source = Arc::new(FakeSource::default());
        let (cloud, cloud_reg) = registered("cloud", BackendTier::Baseline);
        let (local, local_reg) = registered("local", BackendTier::Advanced);
        let selector = Arc::new(ProviderSelector::new(
            vec![cloud_reg, local_reg],
            entitlements(source.clone()),
        ));
        let (escalator, worker) = CrisisEscalator::new(
            Duration::from_secs(60),
            Arc::new(FlakySink::default()),
            Arc::new(MemoryOutbox::default()),
            Arc::new(RecordingAlerts::default()),
            RetryPolicy::default(),
        );
        let orchestrator = Orchestrator::new(
            selector,
            Arc::new(escalator),
            RiskThresholds::default(),
            Duration::from_secs(5),
            SelectionStrategy::Auto,
            vec![CrisisResource {
                name: "988 Suicide & Crisis Lifeline".to_string(),
                contact: "Call or text 988".to_string(),
                url: None,
            }],
        );
        Harness {
            orchestrator,
            worker,
            cloud,
            local,
            source,
        }
    }

    fn command(user_id: Uuid, message: &str) -> ChatCommand {
        ChatCommand {
            user_id,
            message: message.to_string(),
            strategy: None,
            preferred_backend: None,
            capability: Capability::Standard,
            message_ref: Some("msg-1".to_string()),
        }
    }

    #[tokio::test]
    async fn benign_reply_has_no_banner_and_no_escalation() {
        let mut h = harness();
        let reply = h
            .orchestrator
            .handle(command(Uuid::now_v7(), "hello"))
            .await
            .expect("chat");
        assert_eq!(reply.meta.backend, "cloud");
        assert_eq!(reply.meta.risk_level, RiskLevel::None);
        assert!(!reply.safety_banner);
        assert!(reply.crisis_resources.is_empty());
        assert!(h.worker.try_next().is_none());
    }

    #[tokio::test]
    async fn crisis_reply_carries_resources_and_queues_a_flag() {
        let mut h = harness();
        h.cloud.set(Behavior::Reply {
            label: Some("CRISIS"),
            score: Some(0.2),
        });
        let user = Uuid::now_v7();
        let reply = h
            .orchestrator
            .handle(command(user, "it is all too much"))
            .await
            .expect("chat");
        assert_eq!(reply.meta.risk_level, RiskLevel::Critical);
        assert!(reply.safety_banner);
        assert_eq!(reply.crisis_resources.len(), 1);

        match h.worker.try_next() {
            Some(EscalationJob::CreateFlag(flag)) => {
                assert_eq!(flag.user_id, user);
                assert_eq!(flag.triggering_message_ref, "msg-1");
            }
            other => panic!("expected a crisis flag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_safety_signal_fails_safe() {
        let mut h = harness();
        h.cloud.set(Behavior::Reply {
            label: None,
            score: None,
        });
        let reply = h
            .orchestrator
            .handle(command(Uuid::now_v7(), "hello"))
            .await
            .expect("chat");
        assert_eq!(reply.meta.risk_level, RiskLevel::High);
        assert_eq!(reply.meta.safety, "unknown");
        assert!(h.worker.try_next().is_some());
    }

    #[tokio::test]
    async fn failing_primary_falls_back_to_alternate() {
        let h = harness();
        let user = Uuid::now_v7();
        h.source.set(user, SubscriptionStatus::Active);
        h.local.set(Behavior::Fail);

        let mut cmd = command(user, "hello");
        cmd.capability = Capability::Advanced;
        let reply = h.orchestrator.handle(cmd).await.expect("chat");

        assert_eq!(reply.meta.backend, "cloud");
        assert!(reply.meta.degraded);
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 2, "one retry");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_backend_times_out_and_surfaces_without_alternate() {
        let h = harness();
        h.cloud.set(Behavior::Hang);

        let err = h
            .orchestrator
            .handle(command(Uuid::now_v7(), "hello"))
            .await
            .expect_err("free user has no alternate");
        match err {
            ChatError::Backend { backend, source } => {
                assert_eq!(backend, "cloud");
                assert!(source.is_timeout());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_failures_open_the_circuit() {
        let h = harness();
        h.cloud.set(Behavior::Fail);
        for _ in 0..3 {
            let _ = h.orchestrator.handle(command(Uuid::now_v7(), "hello")).await;
        }
        let err = h
            .orchestrator
            .handle(command(Uuid::now_v7(), "hello"))
            .await
            .expect_err("circuit open");
        assert!(matches!(
            err,
            ChatError::Selection(SelectionError::NoBackendAvailable)
        ));
        assert_eq!(h.cloud.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_selection() {
        let h = harness();
        let err = h
            .orchestrator
            .handle(command(Uuid::now_v7(), "   "))
            .await
            .expect_err("empty");
        assert!(matches!(err, ChatError::EmptyMessage));
        assert_eq!(h.cloud.calls.load(Ordering::SeqCst), 0);
    }
}
