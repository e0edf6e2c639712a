use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod alerts;
mod auth;
mod backends;
mod circuit;
mod config;
mod entitlement;
mod error;
mod escalation;
mod extract;
mod ledger;
mod middleware;
mod orchestrator;
mod premium;
mod retry;
mod routes;
mod screening;
mod selector;
mod state;

/// Time allowed for queued crisis escalations to drain on shutdown.
const ESCALATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "MindEase Engine API",
        version = "0.1.0",
        description = "Entitlement-aware chat orchestration with crisis escalation for the MindEase mental-health assistant."
    ),
    paths(
        routes::health::health_check,
        routes::webhooks::receive_billing_webhook,
        routes::chat::chat,
        routes::chat::chat_advanced,
        routes::entitlement::get_entitlement,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::health::BackendHealth,
        routes::webhooks::WebhookAck,
        routes::entitlement::EntitlementResponse,
        circuit::BreakerState,
        mindease_core::error::ApiError,
        mindease_core::billing::WebhookEnvelope,
        mindease_core::chat::ChatRequest,
        mindease_core::chat::ChatReply,
        mindease_core::chat::ChatMeta,
        mindease_core::chat::Citation,
        mindease_core::chat::CrisisResource,
        mindease_core::risk::RiskLevel,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mindease_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "mindease engine stopped with an error");
        std::process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("failed to connect to database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

async fn run() -> Result<(), StartupError> {
    let engine_config = config::EngineConfig::from_env()?;

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| StartupError::MissingDatabaseUrl)?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    // Per-call deadlines are enforced by the orchestrator; this only bounds connects.
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;

    let components = state::Components::from_config(&pool, &engine_config, http);
    let (app_state, escalation_worker) = state::AppState::build(pool, engine_config, components);
    let escalation = tokio::spawn(escalation_worker.run());

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::webhooks::router().layer(middleware::rate_limit::webhook_layer()))
        .merge(routes::chat::router().layer(middleware::rate_limit::chat_layer()))
        .merge(
            routes::chat::premium_router(app_state.premium.clone())
                .layer(middleware::rate_limit::chat_layer()),
        )
        .merge(routes::entitlement::router().layer(middleware::rate_limit::entitlement_layer()))
        .layer(auth::InjectAuthLayer::new(app_state.db.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors::build_cors_layer())
                .layer(axum::middleware::from_fn(middleware::security_headers::apply)),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("MindEase engine listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // The router (and with it every escalator handle) is gone; the worker
    // finishes what is queued and exits. Anything cut off by the timeout is
    // still staged in the outbox and replayed on the next start.
    match tokio::time::timeout(ESCALATION_DRAIN_TIMEOUT, escalation).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "escalation worker panicked"),
        Err(_) => tracing::error!(
            timeout_secs = ESCALATION_DRAIN_TIMEOUT.as_secs(),
            "escalation queue not drained before shutdown"
        ),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
