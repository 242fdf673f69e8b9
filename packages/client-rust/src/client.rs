//! Connection to one host: correlation of calls and responses, the cache
//! pump and event routing.
//!
//! Two tasks run per client:
//!
//! 1. **writer** -- forwards encoded requests to the transport sink
//! 2. **pump** -- decodes host frames; for a response it first brings the
//!    cache up to date, then completes the waiting caller; for an event it
//!    forwards the payload to the matching subscription
//!
//! Because the pump handles frames one at a time, a caller never sees a
//! result computed against a newer host state than its own cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hostlink_core::{
    codec, EmitterKind, Event, FallbackTable, Mutation, MutationId, Request, ResourceId, Response,
    Snapshot, StoreBlueprint, SubscriptionHandle, WireFormat,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::proxy::ResourceProxy;
use crate::subscription::StreamSubscription;
use crate::transport::{ClientTransport, FrameSink, FrameSource};

/// Name of the host's built-in control resource.
pub const CONTROL_RESOURCE: &str = "Host";

/// What the pump hands back to a waiting caller.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) result: Option<Value>,
    /// Route for events addressed to a handle returned as the result,
    /// registered before any later frame is read.
    pub(crate) events: Option<(SubscriptionHandle, mpsc::UnboundedReceiver<Event>)>,
}

/// Per-call options on top of the client defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub no_return: bool,
    pub compact_mode: Option<bool>,
}

type Pending = DashMap<String, oneshot::Sender<Result<Reply, ClientError>>>;

pub(crate) struct ClientInner {
    config: ClientConfig,
    format: WireFormat,
    blueprint: StoreBlueprint,
    fallbacks: FallbackTable,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    routes: DashMap<ResourceId, mpsc::UnboundedSender<Event>>,
    cache: RwLock<LocalCache>,
    connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to a host connection.
#[derive(Clone)]
pub struct HostClient {
    inner: Arc<ClientInner>,
}

impl HostClient {
    /// Starts the writer and pump tasks over `transport`.
    ///
    /// `blueprint` must match the host's so mutations replay identically;
    /// `fallbacks` lists the reads that may be answered from the cache.
    #[must_use]
    pub fn connect<T: ClientTransport>(
        transport: T,
        blueprint: StoreBlueprint,
        fallbacks: FallbackTable,
        config: ClientConfig,
    ) -> Self {
        let format = transport.format();
        let (sink, source) = transport.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            format,
            cache: RwLock::new(LocalCache::new(&blueprint)),
            blueprint,
            fallbacks,
            outbound,
            pending: DashMap::new(),
            routes: DashMap::new(),
            connected: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&inner)));
        let pump = tokio::spawn(pump_loop(source, Arc::clone(&inner)));
        inner.tasks.lock().extend([writer, pump]);
        info!(format = format.as_str(), "client attached to host");

        Self { inner }
    }

    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.inner.format
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Read access to the cached state.
    pub fn cache(&self) -> RwLockReadGuard<'_, LocalCache> {
        self.inner.cache.read()
    }

    #[must_use]
    pub fn cursor(&self) -> MutationId {
        self.inner.cache.read().cursor()
    }

    #[must_use]
    pub fn fallbacks(&self) -> &FallbackTable {
        &self.inner.fallbacks
    }

    /// Number of calls still waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Proxy for the resource named by `resource`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Resource` if the identifier is malformed.
    pub fn resource(&self, resource: &str) -> Result<ResourceProxy, ClientError> {
        Ok(self.proxy(ResourceId::parse(resource)?))
    }

    #[must_use]
    pub fn proxy(&self, resource: ResourceId) -> ResourceProxy {
        ResourceProxy::new(self.clone(), resource)
    }

    /// Sends one request and waits for its response.
    pub(crate) async fn request(
        &self,
        resource: ResourceId,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Reply, ClientError> {
        let id = Uuid::new_v4().to_string();
        let mut request = Request::new(id.clone(), resource, method, args);
        request.params.no_return = options.no_return;
        request.params.compact_mode = options
            .compact_mode
            .unwrap_or(self.inner.config.compact_mode);
        request.params.window_id.clone_from(&self.inner.config.window_id);
        request.params.mutation_id = Some(self.cursor());
        let frame = codec::encode(&request, self.inner.format)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        if !self.is_connected() || self.inner.outbound.send(frame).is_err() {
            self.inner.pending.remove(&id);
            return Err(ClientError::Disconnected);
        }
        debug!(id = %id, method, "request sent");

        let outcome = match self.inner.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.pending.remove(&id);
                    return Err(ClientError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| ClientError::Disconnected)?
    }

    /// Calls a method of the control resource with catch-up payloads
    /// suppressed.
    async fn control(&self, method: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let options = CallOptions {
            compact_mode: Some(true),
            ..CallOptions::default()
        };
        let reply = self
            .request(ResourceId::parse(CONTROL_RESOURCE)?, method, args, options)
            .await?;
        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// Brings the cache fully up to date: the missing log suffix, or a
    /// snapshot baseline when the host no longer retains it.
    ///
    /// # Errors
    ///
    /// Transport failures, or a cache that cannot apply what the host sent.
    pub async fn sync(&self) -> Result<MutationId, ClientError> {
        let value = self
            .control("getMutations", vec![json!(self.cursor())])
            .await?;
        let catch_up: CatchUp = serde_json::from_value(value)?;
        let mut cache = self.inner.cache.write();
        match catch_up {
            CatchUp::Snapshot { snapshot } => {
                cache.restore(&snapshot)?;
            }
            CatchUp::Mutations {
                mutation_id,
                mutations,
            } => {
                cache.ingest(mutations)?;
                cache.observe_tail(mutation_id);
            }
        }
        Ok(cache.cursor())
    }

    /// Subscribes to the host's mutation feed so the cache follows every
    /// commit without waiting for the next call.
    ///
    /// # Errors
    ///
    /// As for [`HostClient::sync`], which runs first.
    pub async fn follow(&self) -> Result<(), ClientError> {
        let reply = self
            .request(
                ResourceId::parse(CONTROL_RESOURCE)?,
                "watchMutations",
                vec![],
                CallOptions {
                    compact_mode: Some(true),
                    ..CallOptions::default()
                },
            )
            .await?;
        let mut feed: StreamSubscription<Mutation> =
            StreamSubscription::from_reply(self.clone(), reply)?;
        // Subscribed first so nothing committed in between is missed.
        self.sync().await?;

        let client = self.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                match item {
                    Ok(mutation) => {
                        if let Err(e) = client.inner.cache.write().ingest([mutation]) {
                            warn!(error = %e, "mutation feed could not be applied");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed mutation feed event");
                    }
                }
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    /// Ends a subscription on the host and drops its local route.
    pub(crate) async fn unsubscribe(&self, handle: &ResourceId) -> Result<bool, ClientError> {
        self.inner.routes.remove(handle);
        let removed = self
            .control("unsubscribe", vec![json!(handle.as_str())])
            .await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    /// Drops the local route of a handle without telling the host.
    pub(crate) fn forget(&self, handle: &ResourceId) {
        self.inner.routes.remove(handle);
    }

    /// Sends a fire-and-forget unsubscribe, used from `Drop`.
    pub(crate) fn release(&self, handle: &ResourceId) {
        self.forget(handle);
        if !self.is_connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.clone();
        let handle = handle.clone();
        runtime.spawn(async move {
            if let Err(e) = client.unsubscribe(&handle).await {
                debug!(handle = %handle, error = %e, "release on drop failed");
            }
        });
    }

    /// Stops both tasks and fails every pending call.
    pub async fn disconnect(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        self.inner.fail_all();
    }

    /// Drops the cache; the next call re-fetches the full history.
    pub fn reset_cache(&self) {
        self.inner.cache.write().reset(&self.inner.blueprint);
    }
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("format", &self.inner.format)
            .field("connected", &self.is_connected())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

/// Result of `Host.getMutations`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatchUp {
    Mutations {
        #[serde(rename = "mutationId")]
        mutation_id: MutationId,
        mutations: Vec<Mutation>,
    },
    Snapshot {
        snapshot: Snapshot,
    },
}

impl ClientInner {
    fn fail_all(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ClientError::Disconnected));
            }
        }
        // Dropping the senders ends every subscription.
        self.routes.clear();
    }

    fn handle_frame(&self, response: Response) {
        if let Some(event) = response.event {
            self.route_event(event);
            return;
        }

        self.update_cache(response.snapshot.as_ref(), response.mutations, response.mutation_id);

        let Some(id) = response.id else {
            warn!(error = ?response.error, "host error without a request id");
            return;
        };
        let Some((_, tx)) = self.pending.remove(&id) else {
            debug!(id = %id, "response for an abandoned call");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(ClientError::Host(error)),
            None => Ok(self.reply(response.result)),
        };
        let _ = tx.send(outcome);
    }

    fn update_cache(
        &self,
        snapshot: Option<&Snapshot>,
        mutations: Option<Vec<Mutation>>,
        tail: Option<MutationId>,
    ) {
        let mut cache = self.cache.write();
        if let Some(snapshot) = snapshot {
            if let Err(e) = cache.restore(snapshot) {
                warn!(error = %e, "snapshot baseline rejected by cache");
            }
        }
        if let Some(mutations) = mutations {
            if let Err(e) = cache.ingest(mutations) {
                warn!(error = %e, "catch-up mutations rejected by cache");
            }
        }
        if let Some(tail) = tail {
            cache.observe_tail(tail);
        }
    }

    fn reply(&self, result: Option<Value>) -> Reply {
        let events = result
            .as_ref()
            .and_then(SubscriptionHandle::from_value)
            .map(|handle| {
                let (tx, rx) = mpsc::unbounded_channel();
                self.routes.insert(handle.resource_id.clone(), tx);
                (handle, rx)
            });
        Reply { result, events }
    }

    fn route_event(&self, event: Event) {
        let handle = event.resource_id.clone();
        // A deferred handle is retired by its only event.
        let route = if event.emitter == EmitterKind::Deferred {
            self.routes.remove(&handle).map(|(_, tx)| tx)
        } else {
            self.routes.get(&handle).map(|r| r.value().clone())
        };
        let delivered = route.is_some_and(|tx| tx.send(event).is_ok());
        if !delivered {
            debug!(handle = %handle, "event for unknown handle dropped");
            self.routes.remove(&handle);
        }
    }
}

async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inner: Arc<ClientInner>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "host transport write failed");
            inner.fail_all();
            return;
        }
    }
    sink.close().await;
}

async fn pump_loop<S: FrameSource>(mut source: S, inner: Arc<ClientInner>) {
    while let Some(frame) = source.recv().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "host transport read failed");
                break;
            }
        };
        match codec::decode_response(&bytes, inner.format) {
            Ok(response) => inner.handle_frame(response),
            Err(e) => warn!(error = %e, "undecodable frame from host"),
        }
    }
    info!("host transport closed");
    inner.fail_all();
}

#[cfg(test)]
mod tests {
    use hostlink_core::{ErrorCode, ErrorPayload, StateModule, StoreError};
    use serde::Serialize;

    use super::*;
    use crate::transport::ChannelTransport;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Log {
        lines: Vec<String>,
    }

    impl StateModule for Log {
        const NAME: &'static str = "log";

        fn handles(mutation_type: &str) -> bool {
            mutation_type == "Line"
        }

        fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError> {
            self.lines.push(hostlink_core::decode_payload(mutation_type, payload)?);
            Ok(())
        }
    }

    /// Client wired to a hand-driven fake host.
    struct Harness {
        client: HostClient,
        requests: mpsc::UnboundedReceiver<Vec<u8>>,
        frames: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Harness {
        fn new() -> Self {
            let (to_host, requests) = mpsc::unbounded_channel();
            let (frames, from_host) = mpsc::unbounded_channel();
            let client = HostClient::connect(
                ChannelTransport::new(WireFormat::Json, to_host, from_host),
                StoreBlueprint::new().with::<Log>(),
                FallbackTable::new(),
                ClientConfig::default(),
            );
            Self {
                client,
                requests,
                frames,
            }
        }

        async fn next_request(&mut self) -> Request {
            let bytes = self.requests.recv().await.unwrap();
            codec::decode_request(&bytes, WireFormat::Json).unwrap()
        }

        fn reply(&self, response: &Response) {
            self.frames
                .send(codec::encode(response, WireFormat::Json).unwrap())
                .unwrap();
        }
    }

    fn line(id: u64, text: &str) -> Mutation {
        Mutation::new(MutationId(id), "Line", json!(text))
    }

    fn lines(client: &HostClient) -> Vec<String> {
        client.cache().store().module::<Log>().unwrap().lines.clone()
    }

    #[tokio::test]
    async fn mutations_apply_before_the_caller_resumes() {
        let mut h = Harness::new();
        let proxy = h.client.resource("Console").unwrap();
        let call = tokio::spawn(async move { proxy.call::<String>("print", vec![json!("hi")]).await });

        let req = h.next_request().await;
        assert_eq!(req.params.mutation_id, Some(MutationId::ZERO));
        let mut resp = Response::success(req.id, json!("ok"));
        resp.mutations = Some(vec![line(1, "hi")]);
        resp.mutation_id = Some(MutationId(1));
        h.reply(&resp);

        assert_eq!(call.await.unwrap().unwrap(), "ok");
        assert_eq!(lines(&h.client), vec!["hi"]);
        assert!(h.client.cache().is_synced());
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_not_order() {
        let mut h = Harness::new();
        let a = h.client.resource("A").unwrap();
        let b = h.client.resource("B").unwrap();
        let first = tokio::spawn(async move { a.call::<u32>("n", vec![]).await });
        let req_a = h.next_request().await;
        let second = tokio::spawn(async move { b.call::<u32>("n", vec![]).await });
        let req_b = h.next_request().await;
        assert_ne!(req_a.id, req_b.id);

        h.reply(&Response::success(req_b.id, json!(2)));
        h.reply(&Response::success(req_a.id, json!(1)));
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn host_errors_surface_with_their_code() {
        let mut h = Harness::new();
        let proxy = h.client.resource("A").unwrap();
        let call = tokio::spawn(async move { proxy.call::<Value>("missing", vec![]).await });
        let req = h.next_request().await;
        h.reply(&Response::failure(
            Some(req.id),
            ErrorPayload::new(ErrorCode::MethodNotFound, "A has no method"),
        ));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MethodNotFound));
    }

    #[tokio::test]
    async fn transport_loss_fails_pending_calls() {
        let mut h = Harness::new();
        let proxy = h.client.resource("A").unwrap();
        let call = tokio::spawn(async move { proxy.call::<Value>("slow", vec![]).await });
        h.next_request().await;
        drop(h.frames);

        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Disconnected)
        ));
        assert!(!h.client.is_connected());
        let again = h.client.resource("A").unwrap().call::<Value>("x", vec![]).await;
        assert!(matches!(again, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn request_timeout_abandons_the_call() {
        let (to_host, _requests) = mpsc::unbounded_channel();
        let (_frames, from_host) = mpsc::unbounded_channel::<Vec<u8>>();
        let client = HostClient::connect(
            ChannelTransport::new(WireFormat::Json, to_host, from_host),
            StoreBlueprint::new().with::<Log>(),
            FallbackTable::new(),
            ClientConfig {
                request_timeout: Some(std::time::Duration::from_millis(20)),
                ..ClientConfig::default()
            },
        );
        let err = client.resource("A").unwrap().call::<Value>("x", vec![]).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn handle_route_exists_before_the_first_event() {
        let mut h = Harness::new();
        let proxy = h.client.resource("Job").unwrap();
        let call = tokio::spawn(async move { proxy.deferred::<u32>("start", vec![]).await });
        let req = h.next_request().await;

        let handle = SubscriptionHandle::numbered(EmitterKind::Deferred, 1);
        h.reply(&Response::success(req.id, handle.to_value()));
        h.reply(&Response::for_event(Event {
            resource_id: handle.resource_id.clone(),
            emitter: EmitterKind::Deferred,
            data: json!(42),
            is_rejected: Some(false),
        }));

        let deferred = call.await.unwrap().unwrap();
        assert_eq!(deferred.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn out_of_order_catch_up_waits_for_the_gap() {
        let mut h = Harness::new();
        let proxy = h.client.resource("A").unwrap();

        let p = proxy.clone();
        let call = tokio::spawn(async move { p.call::<Value>("x", vec![]).await });
        let req = h.next_request().await;
        let mut resp = Response::success(req.id, Value::Null);
        resp.mutations = Some(vec![line(2, "b")]);
        resp.mutation_id = Some(MutationId(2));
        h.reply(&resp);
        call.await.unwrap().unwrap();
        assert!(lines(&h.client).is_empty());
        assert!(!h.client.cache().is_synced());

        let call = tokio::spawn(async move { proxy.call::<Value>("x", vec![]).await });
        let req = h.next_request().await;
        assert_eq!(req.params.mutation_id, Some(MutationId::ZERO));
        let mut resp = Response::success(req.id, Value::Null);
        resp.mutations = Some(vec![line(1, "a"), line(2, "b")]);
        resp.mutation_id = Some(MutationId(2));
        h.reply(&resp);
        call.await.unwrap().unwrap();
        assert_eq!(lines(&h.client), vec!["a", "b"]);
    }
}
