use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use mindease_core::error::ApiError;

use crate::auth::AuthenticatedUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/entitlement", get(get_entitlement))
}

/// Response for GET /v1/entitlement
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EntitlementResponse {
    pub user_id: Uuid,
    /// False when the status store could not be reached (fail closed)
    pub premium: bool,
}

/// Current premium entitlement of the caller
///
/// Served from the entitlement cache; a billing event for the caller
/// invalidates it before the webhook is acknowledged.
#[utoipa::path(
    get,
    path = "/v1/entitlement",
    responses(
        (status = 200, description = "Caller's premium status", body = EntitlementResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "billing"
)]
pub async fn get_entitlement(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Json<EntitlementResponse> {
    let premium = state.entitlements.is_premium(user.user_id).await;
    Json(EntitlementResponse {
        user_id: user.user_id,
        premium,
    })
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

    use crate::auth::AuthMethod;
    use crate::config::EngineConfig;
    use crate::entitlement::tests::FakeSource;
    use crate::state::tests::test_state;

    fn request(user_id: Uuid) -> Request<Body> {
        let mut request = Request::builder()
            .uri("/v1/entitlement")
            .body(Body::empty())
            .expect("request should build");
        request.extensions_mut().insert(AuthenticatedUser {
            user_id,
            auth_method: AuthMethod::ApiKey {
                key_id: Uuid::now_v7(),
            },
        });
        request
    }

    async fn premium_flag(app: Router, user_id: Uuid) -> bool {
        let response = app.oneshot(request(user_id)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        body["premium"].as_bool().expect("premium flag")
    }

    #[tokio::test]
    async fn reports_premium_and_free_users() {
        let source = Arc::new(FakeSource::default());
        let premium = Uuid::now_v7();
        source.set(premium, SubscriptionStatus::Active);
        let (state, _worker) = test_state(source, Vec::new(), EngineConfig::default());
        let app = router().with_state(state);

        assert!(premium_flag(app.clone(), premium).await);
        assert!(!premium_flag(app, Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn unreachable_status_store_reads_as_free() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        source.failing.store(true, Ordering::SeqCst);
        let (state, _worker) = test_state(source, Vec::new(), EngineConfig::default());

        assert!(!premium_flag(router().with_state(state), user).await);
    }
}
