//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose host health information for supervisors and
//! operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::session::SessionKind;
use crate::network::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the host is actually healthy. This lets monitoring tools
/// distinguish between "host is up but draining" vs "host is down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();
    let sessions = state.host.sessions();
    let uptime_secs = state.start_time.elapsed().as_secs();

    Json(json!({
        "state": health.as_str(),
        "sessions": {
            "total": sessions.count(),
            "main": sessions.count_by_kind(SessionKind::Main),
            "child": sessions.count_by_kind(SessionKind::Child),
            "worker": sessions.count_by_kind(SessionKind::Worker),
        },
        "subscriptions": state.host.events().active_count(),
        "mutation_tail": state.host.tail().0,
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": uptime_secs,
    }))
}

/// Liveness check -- always returns 200 OK while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check -- returns 200 when ready, 503 otherwise.
///
/// Returns 503 during startup (before `set_ready()` is called), during
/// graceful shutdown (Draining state), and after stop.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use hostlink_core::{Request, ResourceId, WireFormat};

    use super::*;
    use crate::demo;
    use crate::host::HostBuilder;
    use crate::network::NetworkConfig;

    fn test_state() -> AppState {
        let host = demo::register(HostBuilder::new(demo::blueprint())).build();
        AppState {
            shutdown: host.shutdown_controller(),
            host,
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let state = test_state();
        state.shutdown.set_ready();

        let response = health_handler(State(state)).await;
        let json = response.0;

        assert_eq!(json["state"], "ready");
        assert_eq!(json["sessions"]["total"], 0);
        assert_eq!(json["subscriptions"], 0);
        assert_eq!(json["mutation_tail"], 0);
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_starting_state() {
        let state = test_state();
        let response = health_handler(State(state)).await;
        assert_eq!(response.0["state"], "starting");
    }

    #[tokio::test]
    async fn health_handler_reports_draining_state() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.begin_drain();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["state"], "draining");
    }

    #[tokio::test]
    async fn health_handler_reports_sessions_by_kind() {
        let state = test_state();
        let (_main, _rx1) = state.host.attach(SessionKind::Main, WireFormat::Json);
        let (_worker, _rx2) = state.host.attach(SessionKind::Worker, WireFormat::MsgPack);

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["sessions"]["total"], 2);
        assert_eq!(response.0["sessions"]["main"], 1);
        assert_eq!(response.0["sessions"]["child"], 0);
        assert_eq!(response.0["sessions"]["worker"], 1);
    }

    #[tokio::test]
    async fn health_handler_reports_mutation_tail() {
        let state = test_state();
        state
            .host
            .call(Request::new(
                "1",
                ResourceId::parse("SceneList").unwrap(),
                "addScene",
                vec![serde_json::json!("Intro")],
            ))
            .await;

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["mutation_tail"], 1);
    }

    #[tokio::test]
    async fn health_handler_reports_in_flight_count() {
        let state = test_state();
        let _guard = state.shutdown.in_flight_guard();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        let status = liveness_handler().await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_200_when_ready() {
        let state = test_state();
        state.shutdown.set_ready();

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_when_starting() {
        let state = test_state();
        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_when_draining() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.begin_drain();

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
