//! HTTP layers around the host's routes.
//!
//! Every request gets an `x-request-id` before it is traced, so the span and
//! the response carry the same id. Only `POST /rpc` is bounded by the
//! request timeout: a WebSocket session outlives any single request.

use std::time::Duration;

use axum::extract::Request;
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use super::config::NetworkConfig;

const REQUEST_ID: &str = "x-request-id";

/// Wraps `router` with request ids, tracing and CORS.
///
/// `Router::layer` makes the last layer the outermost, so the id is set
/// first, then traced, and copied onto the response last.
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let request_id = HeaderName::from_static(REQUEST_ID);
    router
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

/// Timeout for one sessionless request.
#[must_use]
pub fn rpc_timeout(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

fn request_span(request: &Request) -> Span {
    let id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "http",
        method = %request.method(),
        path = request.uri().path(),
        request_id = id,
    )
}

/// `"*"` allows any origin (the default for loopback clients); otherwise
/// only the listed origins, e.g. an embedded webview's `tauri://localhost`.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    use super::*;

    fn app(config: &NetworkConfig) -> Router {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/rpc",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                })
                .layer(rpc_timeout(Duration::from_millis(20))),
            );
        with_http_layers(router, config)
    }

    fn get_request(uri: &str, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(origin) = origin {
            builder = builder.header("origin", origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn responses_carry_a_generated_request_id() {
        let response = app(&NetworkConfig::default())
            .oneshot(get_request("/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID));
    }

    #[tokio::test]
    async fn caller_request_id_is_kept() {
        let request = Request::builder()
            .uri("/health")
            .header(REQUEST_ID, "abc")
            .body(Body::empty())
            .unwrap();
        let response = app(&NetworkConfig::default()).oneshot(request).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID], "abc");
    }

    #[tokio::test]
    async fn listed_origins_are_echoed() {
        let config = NetworkConfig {
            cors_origins: vec!["tauri://localhost".to_string()],
            ..NetworkConfig::default()
        };
        let response = app(&config)
            .oneshot(get_request("/health", Some("tauri://localhost")))
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "tauri://localhost"
        );

        let response = app(&config)
            .oneshot(get_request("/health", Some("http://elsewhere")))
            .await
            .unwrap();
        assert!(!response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn slow_rpc_times_out() {
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .body(Body::empty())
            .unwrap();
        let response = app(&NetworkConfig::default()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
