//! The host: authoritative state, resources and attached sessions.
//!
//! A [`HostBuilder`] collects the state blueprint, configuration and
//! resource registrations; [`HostBuilder::build`] produces a cloneable
//! [`Host`] that transports feed frames into.

use std::sync::Arc;
use std::time::Duration;

use hostlink_core::{
    MutationId, Request, ResourceId, Response, StateStore, StoreBlueprint, SubscriptionHandle,
    WireFormat,
};
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::network::local::LocalConnection;
use crate::network::session::{
    encode_frame, OutboundMessage, SendError, SessionHandle, SessionId, SessionKind,
    SessionRegistry,
};
use crate::network::shutdown::ShutdownController;
use crate::service::control;
use crate::service::middleware::{build_dispatch_pipeline, DispatchPipeline};
use crate::service::resource::FromArgs;
use crate::service::worker::{BackgroundWorker, CompactionRunnable, CompactionTask};
use crate::service::{
    Dispatched, Dispatcher, EventMultiplexer, HostConfig, InboundRequest, MethodTable,
    ResolveError, ResourceRegistry,
};
use crate::state::{HostState, SharedState};

// ---------------------------------------------------------------------------
// HostBuilder
// ---------------------------------------------------------------------------

/// Collects everything a [`Host`] needs before it starts serving.
pub struct HostBuilder {
    blueprint: StoreBlueprint,
    config: HostConfig,
    registry: Arc<ResourceRegistry>,
}

impl HostBuilder {
    /// Starts a builder for the given state blueprint. The built-in `Host`
    /// control resource is registered automatically.
    #[must_use]
    pub fn new(blueprint: StoreBlueprint) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        control::register(&registry);
        Self {
            blueprint,
            config: HostConfig::default(),
            registry,
        }
    }

    #[must_use]
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a singleton resource, created on first use.
    #[must_use]
    pub fn singleton<R, F>(self, name: &str, table: MethodTable<R>, ctor: F) -> Self
    where
        R: Send + Sync + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.registry.register_singleton(name, table, ctor);
        self
    }

    /// Registers a per-instance resource, rebuilt from its identifier
    /// arguments on every resolution.
    #[must_use]
    pub fn instance<R, A, F>(self, name: &str, table: MethodTable<R>, ctor: F) -> Self
    where
        R: Send + Sync + 'static,
        A: FromArgs + 'static,
        F: Fn(A, &StateStore) -> Result<R, ResolveError> + Send + Sync + 'static,
    {
        self.registry.register_instance(name, table, ctor);
        self
    }

    /// Direct access for registrations that need a custom factory.
    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn build(self) -> Host {
        let state = SharedState::new(HostState::new(&self.blueprint));
        let sessions = Arc::new(SessionRegistry::new());
        let events = Arc::new(EventMultiplexer::new(Arc::clone(&sessions)));
        let dispatcher = Dispatcher::new(
            state.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&events),
        );
        let pipeline = build_dispatch_pipeline(dispatcher, &self.config);

        info!(
            resources = ?self.registry.names(),
            modules = ?self.blueprint.module_names(),
            "host built"
        );

        Host {
            inner: Arc::new(HostInner {
                config: self.config,
                state,
                registry: self.registry,
                sessions,
                events,
                pipeline,
                shutdown: Arc::new(ShutdownController::new()),
                compaction: Mutex::new(None),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Cloneable handle to a running host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    state: SharedState,
    registry: Arc<ResourceRegistry>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventMultiplexer>,
    pipeline: DispatchPipeline,
    shutdown: Arc<ShutdownController>,
    compaction: Mutex<Option<BackgroundWorker<CompactionRunnable>>>,
}

impl Host {
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventMultiplexer> {
        &self.inner.events
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.inner.shutdown)
    }

    /// Id of the latest committed mutation.
    #[must_use]
    pub fn tail(&self) -> MutationId {
        self.inner.state.tail()
    }

    // -- sessions -----------------------------------------------------------

    /// Registers a new session. The receiver feeds the transport writer.
    pub fn attach(
        &self,
        kind: SessionKind,
        format: WireFormat,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (handle, rx) = self
            .inner
            .sessions
            .register(kind, format, &self.inner.config.connection);
        info!(session = %handle.id, kind = kind.as_str(), ?format, "session attached");
        (handle, rx)
    }

    /// Removes a session and ends every subscription it owns. Requests
    /// still outstanding on it are abandoned.
    pub async fn detach(&self, id: SessionId) {
        let released = self.inner.events.release_session(id);
        if let Some(handle) = self.inner.sessions.remove(id) {
            let abandoned = handle.metadata.read().await.outstanding.len();
            info!(session = %id, released, abandoned, "session detached");
        }
    }

    /// Attaches an in-process client over a byte pipe.
    #[must_use]
    pub fn connect_local(&self, kind: SessionKind, format: WireFormat) -> LocalConnection {
        LocalConnection::spawn(self.clone(), kind, format)
    }

    // -- dispatch -----------------------------------------------------------

    /// Runs one request through the dispatch pipeline.
    ///
    /// Pipeline rejections (load shedding) become error responses with the
    /// request's id, so every request gets exactly one response.
    pub async fn dispatch(&self, session: Option<SessionId>, request: Request) -> Dispatched {
        let id = request.id.clone();
        let result = self
            .inner
            .pipeline
            .clone()
            .oneshot(InboundRequest { session, request })
            .await;
        match result {
            Ok(dispatched) => dispatched,
            Err(e) => {
                let mut response = Response::error(Some(id), e.code(), e.to_string());
                response.mutation_id = Some(self.tail());
                Dispatched {
                    response,
                    handles: Vec::new(),
                }
            }
        }
    }

    /// Serves one inbound frame from a session: decode, dispatch, queue the
    /// response, then release events for handles the call created.
    ///
    /// `format` is the encoding of this frame; responses are written in the
    /// session's own format.
    pub async fn serve_frame(
        &self,
        session: &Arc<SessionHandle>,
        bytes: &[u8],
        format: WireFormat,
    ) {
        let _guard = self.inner.shutdown.in_flight_guard();
        let timeout = self.inner.config.connection.send_timeout;

        let request = match Dispatcher::decode(bytes, format) {
            Ok(request) => request,
            Err(response) => {
                if let Err(e) = session
                    .send_timeout(OutboundMessage::Frame(response), timeout)
                    .await
                {
                    debug!(session = %session.id, error = %e, "could not report undecodable frame");
                    self.close_stalled(session, e).await;
                }
                return;
            }
        };

        session.begin_request(&request).await;
        let id = request.id.clone();
        let dispatched = self.dispatch(Some(session.id), request).await;
        let handles = self.retire_unreturned(&dispatched.response, dispatched.handles);

        match session
            .send_timeout(OutboundMessage::Frame(Box::new(dispatched.response)), timeout)
            .await
        {
            Ok(()) => self.inner.events.announce(&handles),
            Err(e) => {
                warn!(session = %session.id, request = %id, error = %e, "response not delivered");
                for handle in &handles {
                    self.inner.events.unsubscribe(handle, None);
                }
                self.close_stalled(session, e).await;
            }
        }
        session.finish_request(&id).await;
    }

    /// Closes and detaches a session whose frame missed the send timeout.
    async fn close_stalled(&self, session: &SessionHandle, error: SendError) {
        if error == SendError::Timeout {
            session.close("response backlog exceeded");
            self.detach(session.id).await;
        }
    }

    /// Ends handles the caller will never learn about: the call failed,
    /// suppressed its result, or returned something other than the handle.
    fn retire_unreturned(&self, response: &Response, handles: Vec<ResourceId>) -> Vec<ResourceId> {
        if handles.is_empty() {
            return handles;
        }
        let returned = response
            .result
            .as_ref()
            .and_then(SubscriptionHandle::from_value)
            .map(|h| h.resource_id);
        let (kept, orphaned): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .partition(|h| returned.as_ref() == Some(h));
        for handle in &orphaned {
            self.inner.events.unsubscribe(handle, None);
        }
        if !orphaned.is_empty() {
            debug!(retired = orphaned.len(), "handles not returned to the caller retired");
        }
        kept
    }

    /// Dispatches a request on behalf of the host itself.
    ///
    /// Nobody can receive events or release handles for a sessionless call,
    /// so every handle it creates is retired before returning.
    pub async fn call(&self, request: Request) -> Response {
        let dispatched = self.dispatch(None, request).await;
        for handle in &dispatched.handles {
            self.inner.events.unsubscribe(handle, None);
        }
        dispatched.response
    }

    /// Decodes, dispatches and encodes one sessionless frame.
    pub async fn call_frame(&self, bytes: &[u8], format: WireFormat) -> Option<Vec<u8>> {
        let _guard = self.inner.shutdown.in_flight_guard();
        let response = match Dispatcher::decode(bytes, format) {
            Ok(request) => self.call(request).await,
            Err(response) => *response,
        };
        encode_frame(&response, format)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Starts the background log compaction worker. No-op if running.
    pub async fn start_compaction(&self) {
        let mut slot = self.inner.compaction.lock().await;
        if slot.is_some() {
            return;
        }
        let runnable = CompactionRunnable::new(
            self.inner.state.clone(),
            Arc::clone(&self.inner.sessions),
            self.inner.config.retention,
        );
        *slot = Some(BackgroundWorker::start(
            runnable,
            self.inner.config.compaction_interval_ms,
        ));
        info!(
            interval_ms = self.inner.config.compaction_interval_ms,
            "log compaction started"
        );
    }

    /// Asks the compaction worker to run now.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is not running.
    pub async fn compact_now(&self) -> anyhow::Result<()> {
        match self.inner.compaction.lock().await.as_ref() {
            Some(worker) => worker.submit(CompactionTask::RunNow).await,
            None => Err(anyhow::anyhow!("compaction worker not started")),
        }
    }

    /// Refuses new sessions, closes the attached ones and waits up to
    /// `timeout` for frames already being served. Returns `false` if frames
    /// were still in flight at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let shutdown = &self.inner.shutdown;
        shutdown.begin_drain();

        let sessions = self.inner.sessions.drain_all();
        for handle in &sessions {
            self.inner.events.release_session(handle.id);
            handle.close("host shutting down");
        }

        let drained = shutdown.wait_for_drain(timeout).await;
        if drained {
            info!(closed = sessions.len(), "host drained");
        } else {
            warn!(
                closed = sessions.len(),
                in_flight = shutdown.in_flight_count(),
                "drain timed out with frames in flight"
            );
        }
        drained
    }

    /// Stops background work, drains sessions and shuts resources down in
    /// reverse creation order.
    ///
    /// # Errors
    ///
    /// Returns the first resource shutdown failure.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(mut worker) = self.inner.compaction.lock().await.take() {
            worker.stop().await;
        }
        self.drain(self.inner.config.connection.send_timeout).await;
        self.inner.registry.shutdown_all()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
