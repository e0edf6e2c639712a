use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use mindease_core::auth::{TokenKind, hash_token, key_prefix};
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Caller identity resolved from the `Authorization: Bearer <token>` header.
///
/// Resolved once at the boundary by `InjectAuthLayer`; handlers and the
/// premium guard read it from request extensions and never see the token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone)]
pub enum AuthMethod {
    ApiKey { key_id: Uuid },
    AccessToken { token_id: Uuid },
}

// --- Tower Layer/Service for auth injection ---

/// Tower Layer that injects `AuthenticatedUser` into request extensions.
/// Silently continues on auth failure; protected handlers reject later.
#[derive(Clone)]
pub struct InjectAuthLayer {
    pool: sqlx::PgPool,
}

impl InjectAuthLayer {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

impl<S> Layer<S> for InjectAuthLayer {
    type Service = InjectAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectAuthService {
            inner,
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectAuthService<S> {
    inner: S,
    pool: sqlx::PgPool,
}

impl<S> Service<Request> for InjectAuthService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let pool = self.pool.clone();

        // Headers are Send-safe, Body is not
        let token = extract_bearer_token(req.headers());

        Box::pin(async move {
            // A client-supplied extension must never stand in for a verified one.
            req.extensions_mut().remove::<AuthenticatedUser>();
            if let Some(token) = token {
                match authenticate_token(&token, &pool).await {
                    Ok(auth_user) => {
                        req.extensions_mut().insert(auth_user);
                    }
                    Err(err) => tracing::debug!(error = ?err, "bearer token not accepted"),
                }
            }
            Ok(ready.oneshot(req).await.into_response())
        })
    }
}

fn extract_bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let auth_header = headers.get("authorization")?.to_str().ok()?;
    auth_header
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

async fn authenticate_token(
    token: &str,
    pool: &sqlx::PgPool,
) -> Result<AuthenticatedUser, AppError> {
    match TokenKind::detect(token) {
        Some(TokenKind::ApiKey) => authenticate_api_key(token, pool).await,
        Some(TokenKind::AccessToken) => authenticate_access_token(token, pool).await,
        None => Err(AppError::Unauthorized {
            message: "Invalid token format".to_string(),
            docs_hint: Some(
                "Token must start with 'mind_sk_' (API key) or 'mind_at_' (access token)."
                    .to_string(),
            ),
        }),
    }
}

// --- Extractor (used by handlers) ---

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Fast path: auth middleware already validated the token
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        // Slow path: no middleware ran (shouldn't happen in normal flow)
        if parts.headers.get("authorization").is_none() {
            return Err(AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
                docs_hint: Some(
                    "Include 'Authorization: Bearer <token>' header. \
                     Use an API key (mind_sk_...) or access token (mind_at_...)."
                        .to_string(),
                ),
            });
        }
        let token = extract_bearer_token(&parts.headers).ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must use Bearer scheme".to_string(),
            docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
        })?;

        authenticate_token(&token, &state.db).await
    }
}

async fn authenticate_api_key(
    token: &str,
    pool: &sqlx::PgPool,
) -> Result<AuthenticatedUser, AppError> {
    let token_hash = hash_token(token);

    let row = sqlx::query_as::<_, ApiKeyRow>(
        "SELECT id, user_id, expires_at \
         FROM api_keys \
         WHERE key_hash = $1 \
           AND is_revoked = FALSE",
    )
    .bind(&token_hash)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| {
        tracing::debug!(key_prefix = %key_prefix(token), "unknown or revoked api key");
        AppError::Unauthorized {
            message: "Invalid API key".to_string(),
            docs_hint: Some(
                "Check that the API key is correct and has not been revoked.".to_string(),
            ),
        }
    })?;

    if let Some(expires_at) = row.expires_at {
        if Utc::now() > expires_at {
            return Err(AppError::Unauthorized {
                message: "API key has expired".to_string(),
                docs_hint: Some("Issue a new API key.".to_string()),
            });
        }
    }

    // Fire-and-forget last_used_at update
    let pool_clone = pool.clone();
    let key_id = row.id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&pool_clone)
            .await;
    });

    Ok(AuthenticatedUser {
        user_id: row.user_id,
        auth_method: AuthMethod::ApiKey { key_id: row.id },
    })
}

async fn authenticate_access_token(
    token: &str,
    pool: &sqlx::PgPool,
) -> Result<AuthenticatedUser, AppError> {
    let token_hash = hash_token(token);

    let row = sqlx::query_as::<_, AccessTokenRow>(
        "SELECT id, user_id, expires_at \
         FROM access_tokens \
         WHERE token_hash = $1 \
           AND is_revoked = FALSE",
    )
    .bind(&token_hash)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::Unauthorized {
        message: "Invalid access token".to_string(),
        docs_hint: Some(
            "Check that the access token is correct and has not been revoked.".to_string(),
        ),
    })?;

    if Utc::now() > row.expires_at {
        return Err(AppError::Unauthorized {
            message: "Access token has expired".to_string(),
            docs_hint: Some("Obtain a new access token from the identity provider.".to_string()),
        });
    }

    Ok(AuthenticatedUser {
        user_id: row.user_id,
        auth_method: AuthMethod::AccessToken { token_id: row.id },
    })
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    user_id: Uuid,
    expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct AccessTokenRow {
    id: Uuid,
    user_id: Uuid,
    expires_at: chrono::DateTime<Utc>,
}
