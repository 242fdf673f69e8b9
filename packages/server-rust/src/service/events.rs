//! Event multiplexer: routes asynchronous results to the session that owns
//! the subscription handle.
//!
//! A handle is created during an invocation and returned as that call's
//! result. Events emitted before the response carrying the handle has been
//! written are buffered and flushed by [`EventMultiplexer::announce`], so a
//! client never sees an event for a handle it has not learned yet.
//!
//! Delivery never skips an event on a live session. If a session's outbound
//! channel is full the session is closed and its handles released, so the
//! client observes a disconnect instead of a gap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hostlink_core::{
    EmitterKind, ErrorCode, ErrorPayload, Event, ResourceId, Response, SubscriptionHandle,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::network::session::{OutboundMessage, SendError, SessionId, SessionRegistry};

// ---------------------------------------------------------------------------
// Subscription bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Subscription {
    session: Option<SessionId>,
    kind: EmitterKind,
    /// Set by unsubscribe or session release; no further delivery.
    closed: AtomicBool,
    /// Deferred only: the single event has been emitted.
    fulfilled: AtomicBool,
    gate: Mutex<Gate>,
}

#[derive(Debug, Default)]
struct Gate {
    announced: bool,
    buffered: Vec<Event>,
}

impl Subscription {
    fn new(session: Option<SessionId>, kind: EmitterKind) -> Self {
        Self {
            session,
            kind,
            closed: AtomicBool::new(false),
            fulfilled: AtomicBool::new(false),
            gate: Mutex::new(Gate::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// EventMultiplexer
// ---------------------------------------------------------------------------

/// Table of live subscription handles and their owning sessions.
#[derive(Debug)]
pub struct EventMultiplexer {
    entries: DashMap<ResourceId, Arc<Subscription>>,
    next_id: AtomicU64,
    sessions: Arc<SessionRegistry>,
}

impl EventMultiplexer {
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            sessions,
        }
    }

    fn register(&self, session: Option<SessionId>, kind: EmitterKind) -> SubscriptionHandle {
        let handle =
            SubscriptionHandle::numbered(kind, self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(
            handle.resource_id.clone(),
            Arc::new(Subscription::new(session, kind)),
        );
        handle
    }

    /// Creates a single-fulfilment handle owned by `session`.
    pub fn deferred(self: &Arc<Self>, session: Option<SessionId>) -> (SubscriptionHandle, Deferred) {
        let handle = self.register(session, EmitterKind::Deferred);
        let deferred = Deferred {
            handle: handle.resource_id.clone(),
            mux: Some(Arc::clone(self)),
        };
        (handle, deferred)
    }

    /// Creates a multi-event handle owned by `session`.
    pub fn stream(self: &Arc<Self>, session: Option<SessionId>) -> (SubscriptionHandle, StreamEmitter) {
        let handle = self.register(session, EmitterKind::Stream);
        let emitter = StreamEmitter {
            handle: handle.resource_id.clone(),
            mux: Arc::clone(self),
        };
        (handle, emitter)
    }

    /// Emits one event addressed to `handle`.
    ///
    /// Returns `false` when the event was dropped: unknown or retired handle,
    /// second emission on a deferred handle, unsubscribed stream, or a
    /// session that can no longer receive (which is then closed).
    pub fn emit(&self, handle: &ResourceId, data: Value, rejected: bool) -> bool {
        let Some(sub) = self.entries.get(handle).map(|e| Arc::clone(e.value())) else {
            trace!(handle = %handle, "event for retired handle dropped");
            return false;
        };
        if sub.closed.load(Ordering::Acquire) {
            return false;
        }
        if sub.kind == EmitterKind::Deferred && sub.fulfilled.swap(true, Ordering::AcqRel) {
            debug!(handle = %handle, "duplicate deferred emission dropped");
            return false;
        }

        let event = Event {
            resource_id: handle.clone(),
            emitter: sub.kind,
            data,
            is_rejected: (sub.kind == EmitterKind::Deferred).then_some(rejected),
        };

        let mut gate = sub.gate.lock();
        if !gate.announced {
            gate.buffered.push(event);
            return true;
        }
        let delivered = self.deliver(sub.session, event);
        drop(gate);

        if sub.kind == EmitterKind::Deferred {
            self.entries.remove(handle);
        }
        delivered
    }

    /// Marks handles as known to their client and flushes buffered events.
    ///
    /// Called once the response that returned the handles has been queued.
    pub fn announce(&self, handles: &[ResourceId]) {
        for handle in handles {
            let Some(sub) = self.entries.get(handle).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let mut gate = sub.gate.lock();
            gate.announced = true;
            let buffered = std::mem::take(&mut gate.buffered);
            if !sub.closed.load(Ordering::Acquire) {
                for event in buffered {
                    self.deliver(sub.session, event);
                }
            }
            drop(gate);

            if sub.kind == EmitterKind::Deferred && sub.fulfilled.load(Ordering::Acquire) {
                self.entries.remove(handle);
            }
        }
    }

    fn deliver(&self, session: Option<SessionId>, event: Event) -> bool {
        let Some(session) = session else {
            return false;
        };
        let Some(target) = self.sessions.get(session) else {
            return false;
        };
        let handle = event.resource_id.clone();
        match target.try_send(OutboundMessage::Frame(Box::new(Response::for_event(event)))) {
            Ok(()) => true,
            Err(SendError::Full) => {
                warn!(%session, handle = %handle, "outbound channel full, closing session");
                self.sessions.remove(session);
                target.close("event backlog exceeded");
                self.release_session(session);
                false
            }
            Err(_) => false,
        }
    }

    /// Ends a subscription. Only the owning session may unsubscribe; `None`
    /// acts on behalf of the host itself.
    pub fn unsubscribe(&self, handle: &ResourceId, session: Option<SessionId>) -> bool {
        let removed = self
            .entries
            .remove_if(handle, |_, sub| session.is_none() || sub.session == session);
        match removed {
            Some((_, sub)) => {
                sub.closed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Ends every subscription owned by a departing session.
    pub fn release_session(&self, session: SessionId) -> usize {
        let owned: Vec<ResourceId> = self
            .entries
            .iter()
            .filter(|e| e.value().session == Some(session))
            .map(|e| e.key().clone())
            .collect();
        for handle in &owned {
            if let Some((_, sub)) = self.entries.remove(handle) {
                sub.closed.store(true, Ordering::Release);
            }
        }
        owned.len()
    }

    #[must_use]
    pub fn is_active(&self, handle: &ResourceId) -> bool {
        self.entries.contains_key(handle)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Handles currently owned by a session.
    #[must_use]
    pub fn handles_for(&self, session: SessionId) -> Vec<ResourceId> {
        self.entries
            .iter()
            .filter(|e| e.value().session == Some(session))
            .map(|e| e.key().clone())
            .collect()
    }
}

fn to_event_data(value: impl Serialize) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Deferred
// ---------------------------------------------------------------------------

/// Producer side of a single-fulfilment handle.
///
/// `resolve` and `reject` consume it, so the type system rules out a second
/// emission through the same value. Dropping it unfulfilled rejects the
/// handle so the client does not wait forever.
#[derive(Debug)]
pub struct Deferred {
    handle: ResourceId,
    mux: Option<Arc<EventMultiplexer>>,
}

impl Deferred {
    #[must_use]
    pub fn handle(&self) -> &ResourceId {
        &self.handle
    }

    /// Delivers the successful result.
    pub fn resolve(mut self, value: impl Serialize) -> bool {
        match to_event_data(value) {
            Ok(data) => self.fulfil(data, false),
            Err(reason) => self.fulfil(rejection(ErrorCode::InternalJsonRpcError, reason), true),
        }
    }

    /// Delivers a failure.
    pub fn reject(mut self, message: impl Into<String>) -> bool {
        self.fulfil(rejection(ErrorCode::InternalServerError, message), true)
    }

    fn fulfil(&mut self, data: Value, rejected: bool) -> bool {
        match self.mux.take() {
            Some(mux) => mux.emit(&self.handle, data, rejected),
            None => false,
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        if self.mux.is_some() {
            debug!(handle = %self.handle, "deferred dropped without a result");
            self.fulfil(
                rejection(ErrorCode::InternalServerError, "asynchronous result abandoned"),
                true,
            );
        }
    }
}

fn rejection(code: ErrorCode, message: impl Into<String>) -> Value {
    serde_json::to_value(ErrorPayload::new(code, message)).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// StreamEmitter
// ---------------------------------------------------------------------------

/// Producer side of a stream handle. Events are delivered in emission order.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    handle: ResourceId,
    mux: Arc<EventMultiplexer>,
}

impl StreamEmitter {
    #[must_use]
    pub fn handle(&self) -> &ResourceId {
        &self.handle
    }

    /// Emits one event. Returns `false` once the subscription has ended.
    pub fn emit(&self, value: impl Serialize) -> bool {
        match to_event_data(value) {
            Ok(data) => self.mux.emit(&self.handle, data, false),
            Err(reason) => {
                warn!(handle = %self.handle, %reason, "stream event could not be encoded");
                false
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.mux.is_active(&self.handle)
    }

    /// Ends the stream from the producer side.
    pub fn close(self) -> bool {
        self.mux.unsubscribe(&self.handle, None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
