use std::sync::Arc;

use sqlx::PgPool;

use crate::alerts::{OperatorAlerts, PgOperatorAlerts};
use crate::backends::{ChatBackend, CloudBackend, LocalBackend};
use crate::config::EngineConfig;
use crate::entitlement::{EntitlementCache, EntitlementSource, PgEntitlementSource};
use crate::escalation::{
    CrisisEscalator, EscalationOutbox, EscalationSink, EscalationWorker, PgEscalationOutbox,
    PgEscalationSink,
};
use crate::ledger::{BillingLedger, LedgerStore, PgLedgerStore, WebhookLedger};
use crate::orchestrator::Orchestrator;
use crate::premium::PremiumGuard;
use crate::selector::{ProviderSelector, RegisteredBackend};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<EngineConfig>,
    pub ledger: Arc<dyn BillingLedger>,
    pub entitlements: Arc<EntitlementCache>,
    pub premium: PremiumGuard,
    pub orchestrator: Arc<Orchestrator>,
}

/// Collaborators that differ between production and tests.
pub struct Components<S> {
    pub ledger_store: S,
    pub entitlement_source: Arc<dyn EntitlementSource>,
    pub backends: Vec<Arc<dyn ChatBackend>>,
    pub escalation_sink: Arc<dyn EscalationSink>,
    pub escalation_outbox: Arc<dyn EscalationOutbox>,
    pub alerts: Arc<dyn OperatorAlerts>,
}

impl Components<PgLedgerStore> {
    /// Postgres-backed stores and the HTTP backends named in `config`.
    pub fn from_config(db: &PgPool, config: &EngineConfig, http: reqwest::Client) -> Self {
        let mut backends: Vec<Arc<dyn ChatBackend>> = Vec::new();
        if let Some(cloud) = &config.cloud {
            backends.push(Arc::new(CloudBackend::new(http.clone(), cloud)));
        }
        if let Some(local) = &config.local {
            backends.push(Arc::new(LocalBackend::new(http, local)));
        }
        if backends.is_empty() {
            tracing::warn!("no chat backend configured; chat requests will be answered with 503");
        }

        Self {
            ledger_store: PgLedgerStore::new(db.clone()),
            entitlement_source: Arc::new(PgEntitlementSource::new(db.clone())),
            backends,
            escalation_sink: Arc::new(PgEscalationSink::new(db.clone())),
            escalation_outbox: Arc::new(PgEscalationOutbox::new(db.clone())),
            alerts: Arc::new(PgOperatorAlerts::new(db.clone())),
        }
    }
}

impl AppState {
    /// Wire the engine. The returned worker must be spawned by the caller;
    /// it stops once every `AppState` clone is dropped and the queue is empty.
    pub fn build<S: LedgerStore + 'static>(
        db: PgPool,
        config: EngineConfig,
        components: Components<S>,
    ) -> (Self, EscalationWorker) {
        let entitlements = Arc::new(EntitlementCache::new(
            components.entitlement_source,
            config.entitlement_ttl,
            config.entitlement_fetch_timeout,
        ));

        let ledger: Arc<dyn BillingLedger> = Arc::new(WebhookLedger::new(
            components.ledger_store,
            entitlements.clone(),
            components.alerts.clone(),
            config.ledger_max_attempts,
        ));

        let registered = components
            .backends
            .into_iter()
            .map(|backend| Arc::new(RegisteredBackend::new(backend, config.breaker)))
            .collect();
        let selector = Arc::new(ProviderSelector::new(registered, entitlements.clone()));

        let (escalator, worker) = CrisisEscalator::new(
            config.crisis_debounce,
            components.escalation_sink,
            components.escalation_outbox,
            components.alerts,
            config.escalation_retry,
        );

        let orchestrator = Arc::new(Orchestrator::new(
            selector,
            Arc::new(escalator),
            config.risk,
            config.backend_timeout,
            config.default_strategy,
            config.crisis_resources.clone(),
        ));

        let state = Self {
            db,
            config: Arc::new(config),
            ledger,
            premium: PremiumGuard::new(entitlements.clone()),
            entitlements,
            orchestrator,
        };
        (state, worker)
    }
}
