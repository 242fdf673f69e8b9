//! Client sessions: one per attached client process.
//!
//! Provides per-session backpressure via bounded mpsc channels, lock-free
//! session tracking via `DashMap`, and the bookkeeping the dispatcher keeps
//! per client (acknowledged mutation cursor, outstanding request ids, window
//! ids seen).
//!
//! A session the host can no longer feed in order (its outbound channel is
//! full) is closed rather than silently skipped: [`SessionHandle::close`]
//! raises a [`CloseSignal`] that both transport loops watch.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hostlink_core::{codec, ErrorCode, MutationId, Request, Response, WireFormat};
use tokio::sync::{mpsc, watch, RwLock};

use super::config::ConnectionConfig;

/// Unique identifier for a session, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Role of the attached client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    /// The main UI window.
    Main,
    /// A modal or child window.
    #[default]
    Child,
    /// A background worker process.
    Worker,
}

impl SessionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Main => "main",
            SessionKind::Child => "child",
            SessionKind::Worker => "worker",
        }
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(SessionKind::Main),
            "child" => Ok(SessionKind::Child),
            "worker" => Ok(SessionKind::Worker),
            other => Err(format!("unknown session kind {other:?}")),
        }
    }
}

/// Message to be delivered to a session.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A response or event frame, encoded by the transport writer.
    Frame(Box<Response>),
    /// Ask the transport to close with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a session fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    #[error("send timed out")]
    Timeout,
    /// The transport writer has exited.
    #[error("session disconnected")]
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    #[error("outbound channel full")]
    Full,
}

/// Encodes a frame for the wire.
///
/// If the response cannot be represented in `format`, an
/// `INTERNAL_JSON_RPC_ERROR` response with the same id is encoded instead so
/// the caller's pending entry still terminates.
#[must_use]
pub fn encode_frame(response: &Response, format: WireFormat) -> Option<Vec<u8>> {
    match codec::encode(response, format) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(error = %e, id = ?response.id, "failed to encode response frame");
            let fallback = Response::error(
                response.id.clone(),
                ErrorCode::InternalJsonRpcError,
                e.to_string(),
            );
            codec::encode(&fallback, format).ok()
        }
    }
}

/// Handle to a single session.
///
/// The receiver end of the outbound channel is held by the transport writer;
/// this handle holds the sender end.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: Arc<RwLock<SessionMetadata>>,
    pub connected_at: Instant,
    pub kind: SessionKind,
    /// Encoding used for frames written to this session.
    pub format: WireFormat,
    closing: watch::Sender<Option<String>>,
}

impl SessionHandle {
    /// Attempts to enqueue a message without blocking.
    ///
    /// # Errors
    ///
    /// `SendError::Full` when the channel is at capacity,
    /// `SendError::Disconnected` when the writer has exited.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Sends a message, waiting up to `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the channel stays full,
    /// `SendError::Disconnected` if the writer has exited.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.is_closing()
    }

    /// Asks the transport to close this session.
    ///
    /// A `Close` frame is queued when there is room; the signal is raised
    /// regardless, so a full channel cannot hold the session open.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self.try_send(OutboundMessage::Close(Some(reason.clone())));
        self.closing.send_replace(Some(reason));
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.borrow().is_some()
    }

    /// Signal raised by [`SessionHandle::close`]; held by transport loops.
    #[must_use]
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal(self.closing.subscribe())
    }

    /// Records an inbound request before it is dispatched.
    pub async fn begin_request(&self, request: &Request) {
        let mut meta = self.metadata.write().await;
        meta.last_seen = Instant::now();
        meta.requests += 1;
        meta.outstanding.insert(request.id.clone());
        if let Some(cursor) = request.params.mutation_id {
            meta.last_acknowledged = meta.last_acknowledged.max(cursor);
        }
        if let Some(window) = &request.params.window_id {
            if !meta.window_ids.contains(window) {
                meta.window_ids.insert(window.clone());
            }
        }
    }

    /// Clears a request once its response has been handed to the transport.
    pub async fn finish_request(&self, id: &str) {
        self.metadata.write().await.outstanding.remove(id);
    }
}

/// Receiver side of a session's close request.
#[derive(Debug)]
pub struct CloseSignal(watch::Receiver<Option<String>>);

impl CloseSignal {
    /// Resolves with the reason once the host closes the session. Never
    /// resolves if the session handle is dropped without closing.
    pub async fn recv(&mut self) -> String {
        let reason = match self.0.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

/// Mutable bookkeeping for a session.
#[derive(Debug)]
pub struct SessionMetadata {
    /// Highest mutation id the client reported as applied.
    pub last_acknowledged: MutationId,
    /// Request ids dispatched but not yet answered.
    pub outstanding: HashSet<String>,
    /// Window ids that issued requests over this session.
    pub window_ids: HashSet<String>,
    pub last_seen: Instant,
    pub requests: u64,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged: MutationId::ZERO,
            outstanding: HashSet::new(),
            window_ids: HashSet::new(),
            last_seen: Instant::now(),
            requests: 0,
        }
    }
}

/// Thread-safe registry of attached sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry. Session ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a session, returning its handle and the outbound receiver
    /// for the transport writer.
    pub fn register(
        &self,
        kind: SessionKind,
        format: WireFormat,
        config: &ConnectionConfig,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let (closing, _) = watch::channel(None);

        let handle = Arc::new(SessionHandle {
            id,
            tx,
            metadata: Arc::new(RwLock::new(SessionMetadata::default())),
            connected_at: Instant::now(),
            kind,
            format,
            closing,
        });

        self.sessions.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn count_by_kind(&self, kind: SessionKind) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .count()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Lowest mutation cursor acknowledged by any attached session, or `None`
    /// when no session is attached.
    pub async fn min_acknowledged(&self) -> Option<MutationId> {
        let mut lowest: Option<MutationId> = None;
        for handle in self.sessions() {
            let cursor = handle.metadata.read().await.last_acknowledged;
            lowest = Some(lowest.map_or(cursor, |l| l.min(cursor)));
        }
        lowest
    }

    /// Removes and returns all sessions. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<SessionHandle>> {
        let keys: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.sessions.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use hostlink_core::ResourceId;
    use serde_json::json;

    use super::*;

    fn small_channel_config() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    fn frame() -> OutboundMessage {
        OutboundMessage::Frame(Box::new(Response::success("1", json!(null))))
    }

    fn register(registry: &SessionRegistry, kind: SessionKind) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundMessage>) {
        registry.register(kind, WireFormat::Json, &ConnectionConfig::default())
    }

    #[test]
    fn ids_start_at_one() {
        let registry = SessionRegistry::new();
        let (h1, _rx1) = register(&registry, SessionKind::Main);
        let (h2, _rx2) = register(&registry, SessionKind::Child);
        assert_eq!(h1.id, SessionId(1));
        assert_eq!(h2.id, SessionId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn count_by_kind_and_remove() {
        let registry = SessionRegistry::new();
        let (main, _rx1) = register(&registry, SessionKind::Main);
        let (_c1, _rx2) = register(&registry, SessionKind::Child);
        let (_c2, _rx3) = register(&registry, SessionKind::Child);

        assert_eq!(registry.count_by_kind(SessionKind::Child), 2);
        assert_eq!(registry.count_by_kind(SessionKind::Worker), 0);

        assert!(registry.remove(main.id).is_some());
        assert!(registry.remove(main.id).is_none());
        assert!(registry.get(main.id).is_none());
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn try_send_reports_full_and_disconnected() {
        let registry = SessionRegistry::new();
        let (handle, rx) = registry.register(SessionKind::Child, WireFormat::Json, &small_channel_config());

        assert!(handle.try_send(frame()).is_ok());
        assert!(handle.try_send(frame()).is_ok());
        assert_eq!(handle.try_send(frame()), Err(SendError::Full));

        drop(rx);
        assert!(!handle.is_connected());
        assert_eq!(handle.try_send(frame()), Err(SendError::Disconnected));
    }

    #[tokio::test]
    async fn close_is_signalled_even_when_the_channel_is_full() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = registry.register(SessionKind::Child, WireFormat::Json, &small_channel_config());
        let mut signal = handle.close_signal();
        handle.try_send(frame()).unwrap();
        handle.try_send(frame()).unwrap();

        handle.close("backlog");
        assert!(handle.is_closing());
        assert!(!handle.is_connected());
        let reason = tokio::time::timeout(Duration::from_secs(1), signal.recv())
            .await
            .unwrap();
        assert_eq!(reason, "backlog");

        // Only the two queued frames made it; the Close frame did not fit.
        assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Frame(_))));
        assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Frame(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_queues_a_close_frame_when_there_is_room() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = register(&registry, SessionKind::Main);
        handle.close("bye");
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Close(Some(r))) if r == "bye"));
    }

    #[tokio::test]
    async fn send_timeout_expires_on_full_channel() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = registry.register(SessionKind::Child, WireFormat::Json, &small_channel_config());
        handle.try_send(frame()).unwrap();
        handle.try_send(frame()).unwrap();

        let result = handle.send_timeout(frame(), Duration::from_millis(20)).await;
        assert_eq!(result, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn request_bookkeeping_tracks_cursor_and_windows() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = register(&registry, SessionKind::Main);

        let mut req = Request::new("r-1", ResourceId::parse("SceneList").unwrap(), "getScenes", vec![]);
        req.params.mutation_id = Some(MutationId(7));
        req.params.window_id = Some("main".into());
        handle.begin_request(&req).await;

        {
            let meta = handle.metadata.read().await;
            assert_eq!(meta.last_acknowledged, MutationId(7));
            assert!(meta.outstanding.contains("r-1"));
            assert!(meta.window_ids.contains("main"));
        }

        // An older cursor never moves the acknowledgement backwards.
        req.id = "r-2".into();
        req.params.mutation_id = Some(MutationId(3));
        handle.begin_request(&req).await;
        handle.finish_request("r-1").await;

        let meta = handle.metadata.read().await;
        assert_eq!(meta.last_acknowledged, MutationId(7));
        assert_eq!(meta.outstanding.len(), 1);
        assert_eq!(meta.requests, 2);
    }

    #[tokio::test]
    async fn min_acknowledged_across_sessions() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.min_acknowledged().await, None);

        let (a, _rxa) = register(&registry, SessionKind::Main);
        let (b, _rxb) = register(&registry, SessionKind::Worker);
        a.metadata.write().await.last_acknowledged = MutationId(10);
        b.metadata.write().await.last_acknowledged = MutationId(4);

        assert_eq!(registry.min_acknowledged().await, Some(MutationId(4)));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = SessionRegistry::new();
        let (_h1, _rx1) = register(&registry, SessionKind::Main);
        let (_h2, _rx2) = register(&registry, SessionKind::Child);
        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn session_kind_parses() {
        assert_eq!("worker".parse::<SessionKind>(), Ok(SessionKind::Worker));
        assert!("tab".parse::<SessionKind>().is_err());
        assert_eq!(SessionKind::default().as_str(), "child");
    }

    #[test]
    fn encode_frame_uses_requested_format() {
        let resp = Response::success("x", json!([1, 2]));
        let json_bytes = encode_frame(&resp, WireFormat::Json).unwrap();
        assert_eq!(
            codec::decode_response(&json_bytes, WireFormat::Json).unwrap(),
            resp
        );
        let mp = encode_frame(&resp, WireFormat::MsgPack).unwrap();
        assert_eq!(codec::decode_response(&mp, WireFormat::MsgPack).unwrap(), resp);
    }
}
