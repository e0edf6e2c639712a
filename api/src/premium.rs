use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::entitlement::EntitlementCache;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("premium subscription required")]
    PremiumRequired,
}

/// Gate for premium-only operations. Fails closed on a missing identity.
#[derive(Clone)]
pub struct PremiumGuard {
    entitlements: Arc<EntitlementCache>,
}

impl PremiumGuard {
    pub fn new(entitlements: Arc<EntitlementCache>) -> Self {
        Self { entitlements }
    }

    pub async fn check(&self, identity: Option<&AuthenticatedUser>) -> Result<Uuid, GuardError> {
        let user = identity.ok_or(GuardError::Unauthenticated)?;
        if self.entitlements.is_premium(user.user_id).await {
            Ok(user.user_id)
        } else {
            tracing::info!(user_id = %user.user_id, "premium operation denied");
            Err(GuardError::PremiumRequired)
        }
    }

    /// Run `op` for an entitled user; its result is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        identity: Option<&AuthenticatedUser>,
        op: F,
    ) -> Result<T, GuardError>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = T>,
    {
        let user_id = self.check(identity).await?;
        Ok(op(user_id).await)
    }
}

/// Route layer for premium-only routers.
pub async fn require_premium(
    State(guard): State<PremiumGuard>,
    req: Request,
    next: Next,
) -> Response {
    let identity = req.extensions().get::<AuthenticatedUser>().cloned();
    match guard.run(identity.as_ref(), |_| next.run(req)).await {
        Ok(response) => response,
        Err(err) => AppError::from(err).into_response(),
    }
}
