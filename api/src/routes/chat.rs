use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router, middleware};

use mindease_core::chat::{Capability, ChatReply, ChatRequest, SelectionStrategy};
use mindease_core::error::ApiError;

use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::orchestrator::ChatCommand;
use crate::premium::{PremiumGuard, require_premium};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/chat", post(chat))
}

/// Premium-only routes. The guard runs before the handler and its
/// extractors, so unentitled callers never reach a backend.
pub fn premium_router(guard: PremiumGuard) -> Router<AppState> {
    Router::new()
        .route("/v1/chat/advanced", post(chat_advanced))
        .route_layer(middleware::from_fn_with_state(guard, require_premium))
}

fn command(user: &AuthenticatedUser, req: ChatRequest, capability: Capability) -> ChatCommand {
    ChatCommand {
        user_id: user.user_id,
        message: req.message,
        strategy: req.strategy.as_deref().map(SelectionStrategy::parse),
        preferred_backend: req.preferred_backend,
        capability,
        message_ref: req.message_ref,
    }
}

/// Send one chat message
///
/// Routed by entitlement and backend health. Replies classified HIGH or
/// CRITICAL carry a safety banner and crisis resources.
#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Assistant reply with safety metadata", body = ChatReply),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 502, description = "Chat backend failed", body = ApiError),
        (status = 503, description = "No chat backend available", body = ApiError),
        (status = 504, description = "Chat backend timed out", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn chat(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    AppJson(req): AppJson<ChatRequest>,
) -> Result<Json<ChatReply>, AppError> {
    let capability = req
        .capability
        .as_deref()
        .map(Capability::parse)
        .unwrap_or_default();
    let reply = state
        .orchestrator
        .handle(command(&user, req, capability))
        .await?;
    Ok(Json(reply))
}

/// Send one chat message to the advanced (RAG + risk model) backend
///
/// Premium-only. Falls back to the baseline backend, marked `degraded`,
/// when the advanced backend is unavailable.
#[utoipa::path(
    post,
    path = "/v1/chat/advanced",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Assistant reply with safety metadata", body = ChatReply),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 403, description = "Premium subscription required", body = ApiError),
        (status = 502, description = "Chat backend failed", body = ApiError),
        (status = 503, description = "No chat backend available", body = ApiError),
        (status = 504, description = "Chat backend timed out", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn chat_advanced(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    AppJson(req): AppJson<ChatRequest>,
) -> Result<Json<ChatReply>, AppError> {
    let reply = state
        .orchestrator
        .handle(command(&user, req, Capability::Advanced))
        .await?;
    Ok(Json(reply))
}
