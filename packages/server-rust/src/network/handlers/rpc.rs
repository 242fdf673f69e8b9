//! One-shot request endpoint for clients that do not hold a session.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use hostlink_core::WireFormat;

use super::AppState;

const MSGPACK: &str = "application/msgpack";
const JSON: &str = "application/json";

fn request_format(headers: &HeaderMap) -> WireFormat {
    match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) if ct.starts_with(MSGPACK) => WireFormat::MsgPack,
        _ => WireFormat::Json,
    }
}

/// Handles `POST /rpc`: one request frame in, one response frame out.
///
/// The body is JSON unless `Content-Type` is `application/msgpack`; the
/// response uses the same encoding. Subscription handles returned here have
/// no session to receive their events.
pub async fn rpc_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let format = request_format(&headers);
    let content_type = match format {
        WireFormat::Json => JSON,
        WireFormat::MsgPack => MSGPACK,
    };
    match state.host.call_frame(&body, format).await {
        Some(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use axum::body::to_bytes;
    use axum::http::HeaderValue;
    use hostlink_core::{codec, ErrorCode, Request, ResourceId};
    use serde_json::json;

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

    async fn body_of(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn json_request_gets_json_response() {
        let req = Request::new(
            "h1",
            ResourceId::parse("SceneList").unwrap(),
            "addScene",
            vec![json!("Intro")],
        );
        let body = Bytes::from(codec::encode(&req, WireFormat::Json).unwrap());
        let response = rpc_handler(State(test_state()), HeaderMap::new(), body).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], JSON);

        let resp = codec::decode_response(&body_of(response).await, WireFormat::Json).unwrap();
        assert_eq!(resp.id.as_deref(), Some("h1"));
        assert_eq!(resp.result, Some(json!("scene_1")));
    }

    #[tokio::test]
    async fn msgpack_content_type_switches_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MSGPACK));
        let req = Request::property("h2", ResourceId::parse("SceneList").unwrap(), "count");
        let body = Bytes::from(codec::encode(&req, WireFormat::MsgPack).unwrap());

        let response = rpc_handler(State(test_state()), headers, body).await;
        let resp = codec::decode_response(&body_of(response).await, WireFormat::MsgPack).unwrap();
        assert_eq!(resp.result, Some(json!(0)));
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let response =
            rpc_handler(State(test_state()), HeaderMap::new(), Bytes::from_static(b"nope")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let resp = codec::decode_response(&body_of(response).await, WireFormat::Json).unwrap();
        assert_eq!(resp.error.unwrap().kind(), Some(ErrorCode::ParseError));
    }
}
