//! WebSocket attachment: one socket, one session.
//!
//! Text frames carry JSON and binary frames carry MsgPack. Outbound frames
//! use the format chosen at upgrade time (`?format=json|msgpack`).
//!
//! The read loop ends on client close, host drain, or a close request on the
//! session; the writer flushes what is queued and sends a Close frame.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use hostlink_core::WireFormat;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::AppState;
use crate::host::Host;
use crate::network::session::{
    encode_frame, CloseSignal, OutboundMessage, SessionHandle, SessionKind,
};

/// Query parameters accepted on `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct AttachParams {
    pub format: Option<String>,
    pub kind: Option<String>,
}

impl AttachParams {
    fn parse(&self) -> Result<(SessionKind, WireFormat), String> {
        let kind = self
            .kind
            .as_deref()
            .map(str::parse::<SessionKind>)
            .transpose()?
            .unwrap_or_default();
        let format = self
            .format
            .as_deref()
            .map(str::parse::<WireFormat>)
            .transpose()?
            .unwrap_or_default();
        Ok((kind, format))
    }
}

/// Upgrades an HTTP connection to a WebSocket session.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    Query(params): Query<AttachParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.shutdown.health_state().accepts_sessions() {
        return (StatusCode::SERVICE_UNAVAILABLE, "host is shutting down").into_response();
    }
    let (kind, format) = match params.parse() {
        Ok(parsed) => parsed,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    let connection = &state.host.config().connection;
    ws.write_buffer_size(connection.ws_write_buffer_size)
        .max_write_buffer_size(connection.ws_max_write_buffer_size)
        .on_upgrade(move |socket| run_session(socket, state, kind, format))
}

async fn run_session(socket: WebSocket, state: AppState, kind: SessionKind, format: WireFormat) {
    let host = state.host.clone();
    let (session, outbound) = host.attach(kind, format);
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, session.close_signal(), format));
    let mut draining = state.shutdown.drain_receiver();
    let mut closed = session.close_signal();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    host.serve_frame(&session, text.as_str().as_bytes(), WireFormat::Json)
                        .await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    host.serve_frame(&session, &bytes, WireFormat::MsgPack).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session.id, error = %e, "websocket read failed");
                    break;
                }
            },
            () = drain_started(&mut draining) => break,
            reason = closed.recv() => {
                debug!(session = %session.id, %reason, "session closed by host");
                break;
            }
        }
    }

    finish(&host, session, writer).await;
}

async fn drain_started(draining: &mut watch::Receiver<bool>) {
    let _ = draining.wait_for(|d| *d).await;
}

async fn finish(
    host: &Host,
    session: Arc<SessionHandle>,
    writer: tokio::task::JoinHandle<()>,
) {
    let id = session.id;
    host.detach(id).await;
    // The writer ends once the last sender is gone, after flushing what was
    // already queued.
    drop(session);
    let grace = host.config().connection.send_timeout;
    if tokio::time::timeout(grace, writer).await.is_err() {
        warn!(session = %id, "websocket writer did not finish in time");
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut closed: CloseSignal,
    format: WireFormat,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        // Queued frames go out before a close request is honoured.
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            reason = closed.recv() => Some(OutboundMessage::Close(Some(reason))),
        };
        let frame = match message {
            Some(OutboundMessage::Frame(response)) => match encode_frame(&response, format) {
                Some(bytes) => to_message(bytes, format),
                None => continue,
            },
            Some(OutboundMessage::Close(reason)) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    })))
                    .await;
                break;
            }
            None => break,
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
    }
}

fn to_message(bytes: Vec<u8>, format: WireFormat) -> Message {
    match format {
        WireFormat::Json => match String::from_utf8(bytes) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        },
        WireFormat::MsgPack => Message::Binary(bytes.into()),
    }
}
