use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Build a CORS layer from the `MINDEASE_CORS_ORIGINS` env var.
///
/// - Origins: comma-separated list (default: `http://localhost:3000`)
/// - Methods: GET, POST, OPTIONS
/// - Headers: Authorization, Content-Type
/// - Max age: 3600s
///
/// The billing webhook is server-to-server and never needs CORS; the chat
/// and entitlement routes are called from the web client.
pub fn build_cors_layer() -> CorsLayer {
    let origins_str = std::env::var("MINDEASE_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    cors_layer_for(&origins_str)
}

fn parse_origins(origins_str: &str) -> Vec<HeaderValue> {
    origins_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect()
}

fn cors_layer_for(origins_str: &str) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(parse_origins(origins_str))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn blank_entries_are_skipped() {
        let origins = parse_origins("https://app.mindease.io, ,http://localhost:3000,");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://app.mindease.io");
    }

    #[tokio::test]
    async fn listed_origin_is_echoed_back() {
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .layer(cors_layer_for("https://app.mindease.io"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://app.mindease.io")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .expect("allow-origin header should exist"),
            "https://app.mindease.io"
        );
    }
}
