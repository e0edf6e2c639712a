use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mindease_core::chat::{BackendTier, Capability, SelectionStrategy};
use uuid::Uuid;

use crate::backends::ChatBackend;
use crate::circuit::{BreakerConfig, CircuitBreaker};
use crate::entitlement::EntitlementCache;

/// A chat backend together with its health tracker.
pub struct RegisteredBackend {
    pub backend: Arc<dyn ChatBackend>,
    pub breaker: CircuitBreaker,
}

impl RegisteredBackend {
    pub fn new(backend: Arc<dyn ChatBackend>, breaker: BreakerConfig) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn tier(&self) -> BackendTier {
        self.backend.tier()
    }

    /// Usable as a candidate. Does not claim a half-open trial.
    pub fn is_available(&self) -> bool {
        self.breaker.is_available()
    }

    /// Claim the right to call this backend now.
    pub fn try_admit(&self) -> bool {
        self.breaker.try_admit()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub strategy: SelectionStrategy,
    pub preferred_backend: Option<&'a str>,
    pub user_id: Uuid,
    pub capability: Capability,
}

pub struct Selection {
    /// Already admitted by its breaker.
    pub primary: Arc<RegisteredBackend>,
    /// Available backend to fall back to if `primary` fails. Not yet admitted.
    pub alternate: Option<Arc<RegisteredBackend>>,
    /// The first choice was unhealthy and a fallback was picked.
    pub degraded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("no chat backend is available")]
    NoBackendAvailable,
}

/// Picks a backend per request. Advanced-tier backends are only ever offered
/// to entitled users, including as fallbacks.
pub struct ProviderSelector {
    backends: Vec<Arc<RegisteredBackend>>,
    entitlements: Arc<EntitlementCache>,
    cursor: AtomicUsize,
}

impl ProviderSelector {
    pub fn new(backends: Vec<Arc<RegisteredBackend>>, entitlements: Arc<EntitlementCache>) -> Self {
        Self {
            backends,
            entitlements,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn backends(&self) -> &[Arc<RegisteredBackend>] {
        &self.backends
    }

    pub async fn select(&self, request: &SelectionRequest<'_>) -> Result<Selection, SelectionError> {
        let entitled = self.entitlements.is_premium(request.user_id).await;
        let selection = match request.strategy {
            SelectionStrategy::UserPreference => self.by_preference(request, entitled),
            SelectionStrategy::Auto => self.auto(request.capability, entitled),
            SelectionStrategy::RoundRobin => self.round_robin(entitled),
        };

        match &selection {
            Ok(selection) => tracing::debug!(
                user_id = %request.user_id,
                strategy = request.strategy.as_str(),
                backend = selection.primary.name(),
                degraded = selection.degraded,
                entitled,
                "chat backend selected"
            ),
            Err(_) => tracing::warn!(
                user_id = %request.user_id,
                strategy = request.strategy.as_str(),
                "no healthy chat backend"
            ),
        }
        selection
    }

    fn allowed(backend: &RegisteredBackend, entitled: bool) -> bool {
        backend.tier() == BackendTier::Baseline || entitled
    }

    fn by_preference(
        &self,
        request: &SelectionRequest<'_>,
        entitled: bool,
    ) -> Result<Selection, SelectionError> {
        if let Some(name) = request.preferred_backend {
            let preferred = self
                .backends
                .iter()
                .find(|b| b.name().eq_ignore_ascii_case(name.trim()));
            match preferred {
                Some(b) if Self::allowed(b, entitled) && b.try_admit() => {
                    let alternate = self
                        .backends
                        .iter()
                        .find(|other| {
                            !Arc::ptr_eq(other, b)
                                && Self::allowed(other, entitled)
                                && other.is_available()
                        })
                        .cloned();
                    return Ok(Selection {
                        primary: b.clone(),
                        alternate,
                        degraded: false,
                    });
                }
                _ => tracing::debug!(
                    preferred_backend = name,
                    entitled,
                    "preferred backend not usable; falling back to AUTO"
                ),
            }
        }
        self.auto(request.capability, entitled)
    }

    fn auto(&self, capability: Capability, entitled: bool) -> Result<Selection, SelectionError> {
        let wanted = if capability == Capability::Advanced && entitled {
            BackendTier::Advanced
        } else {
            BackendTier::Baseline
        };

        let mut ordered: Vec<&Arc<RegisteredBackend>> = self
            .backends
            .iter()
            .filter(|b| Self::allowed(b, entitled))
            .collect();
        ordered.sort_by_key(|b| b.tier() != wanted);

        let first_choice = ordered.first().ok_or(SelectionError::NoBackendAvailable)?;
        let mut available = ordered.iter().filter(|b| b.is_available());
        let primary = available
            .by_ref()
            .find(|b| b.try_admit())
            .ok_or(SelectionError::NoBackendAvailable)?;
        let alternate = available.next().map(|b| Arc::clone(b));

        Ok(Selection {
            degraded: !Arc::ptr_eq(primary, first_choice),
            primary: Arc::clone(primary),
            alternate,
        })
    }

    fn round_robin(&self, entitled: bool) -> Result<Selection, SelectionError> {
        let pool: Vec<&Arc<RegisteredBackend>> = self
            .backends
            .iter()
            .filter(|b| Self::allowed(b, entitled) && b.is_available())
            .collect();
        if pool.is_empty() {
            return Err(SelectionError::NoBackendAvailable);
        }

        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        let slot = (0..pool.len())
            .map(|offset| (turn + offset) % pool.len())
            .find(|&slot| pool[slot].try_admit())
            .ok_or(SelectionError::NoBackendAvailable)?;
        let primary = pool[slot];
        let alternate = (pool.len() > 1).then(|| Arc::clone(pool[(slot + 1) % pool.len()]));
        Ok(Selection {
            primary: Arc::clone(primary),
            alternate,
            degraded: false,
        })
    }
}
