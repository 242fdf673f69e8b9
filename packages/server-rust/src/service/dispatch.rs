//! Request dispatcher: turns one inbound request into one response.
//!
//! Steps, in order:
//!
//! 1. Decode the frame; malformed bytes answer `PARSE_ERROR`.
//! 2. Validate structure; non-requests answer `INVALID_REQUEST`.
//! 3. Resolve the resource (`RESOURCE_NOT_FOUND`, `INVALID_PARAMS`).
//! 4. Invoke the method under the state lock, capturing committed mutations.
//! 5. Encode the result (`noReturn` calls carry no result).
//! 6. Attach mutations unless `compactMode`: the captured ones plus any the
//!    caller is missing according to its `mutationId` cursor, or a snapshot
//!    when the cursor is outside the retained log.
//! 7. Stamp `mutationId` with the log tail.
//! 8. Report subscription handles created by the call so their events can
//!    be released once the response is on its way.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hostlink_core::{codec, ErrorCode, MutationId, Request, ResourceId, Response, WireFormat};
use tower::Service;
use tracing::{debug, error, warn};

use super::events::EventMultiplexer;
use super::registry::ResourceRegistry;
use super::resource::{CallContext, InvokeError};
use crate::network::session::SessionId;
use crate::state::{HostState, LogError, SharedState};

// ---------------------------------------------------------------------------
// Request/response types for the pipeline
// ---------------------------------------------------------------------------

/// A decoded request plus the session it arrived on.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub session: Option<SessionId>,
    pub request: Request,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: Response,
    /// Subscription handles created during the call.
    pub handles: Vec<ResourceId>,
}

/// Errors raised by pipeline layers before the dispatcher runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("host overloaded, request rejected")]
    Overloaded,
}

impl DispatchError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Overloaded => ErrorCode::InternalServerError,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Executes requests against the registry and host state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: SharedState,
    registry: Arc<ResourceRegistry>,
    events: Arc<EventMultiplexer>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        state: SharedState,
        registry: Arc<ResourceRegistry>,
        events: Arc<EventMultiplexer>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state,
                registry,
                events,
            }),
        }
    }

    /// Steps 1 and 2.
    ///
    /// # Errors
    ///
    /// Returns the error response to send when the frame is not a request.
    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Request, Box<Response>> {
        codec::decode_request(bytes, format).map_err(|rejection| {
            debug!(code = rejection.error.code, id = ?rejection.id, "rejected inbound frame");
            Box::new(Response::failure(rejection.id, rejection.error))
        })
    }

    /// Steps 3 through 8.
    #[must_use]
    pub fn execute(&self, session: Option<SessionId>, request: &Request) -> Dispatched {
        let params = &request.params;
        let mut guard = self.inner.state.lock();
        let before = guard.tail();

        let (outcome, handles) = {
            let mut ctx = CallContext::new(
                &mut guard,
                &self.inner.registry,
                &self.inner.events,
                &self.inner.state,
                session,
                params.window_id.as_deref(),
                params.resource.clone(),
            );
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                ctx.invoke(&params.resource, &request.method, &params.args)
            }));
            (outcome, ctx.into_created())
        };

        let mut response = match outcome {
            Ok(Ok(_)) if params.no_return => Response::empty(request.id.clone()),
            Ok(Ok(value)) => Response::success(request.id.clone(), value),
            Ok(Err(err)) => {
                log_failure(request, &err);
                Response::error(Some(request.id.clone()), err.code(), err.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(
                    resource = %params.resource,
                    method = %request.method,
                    %reason,
                    "invocation panicked"
                );
                Response::error(
                    Some(request.id.clone()),
                    ErrorCode::InternalServerError,
                    format!("invocation panicked: {reason}"),
                )
            }
        };

        let after = guard.tail();
        response.mutation_id = Some(after);
        if !params.compact_mode {
            attach_catch_up(&guard, params.mutation_id, before, &mut response);
        }
        drop(guard);

        Dispatched { response, handles }
    }
}

fn log_failure(request: &Request, err: &InvokeError) {
    match err.code() {
        ErrorCode::InternalServerError | ErrorCode::InternalJsonRpcError => warn!(
            resource = %request.params.resource,
            method = %request.method,
            error = %err,
            "invocation failed"
        ),
        _ => debug!(
            resource = %request.params.resource,
            method = %request.method,
            error = %err,
            "invocation rejected"
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Fills `mutations` (or `snapshot`) so the caller ends up at the tail.
///
/// Without a cursor only the mutations committed by this call are sent.
fn attach_catch_up(
    state: &HostState,
    cursor: Option<MutationId>,
    before: MutationId,
    response: &mut Response,
) {
    let after = state.tail();
    let from = cursor.unwrap_or(before);
    match state.log().since(from) {
        Ok(mutations) => {
            if !mutations.is_empty() {
                response.mutations = Some(mutations);
            }
        }
        Err(LogError::Compacted { .. } | LogError::AheadOfTail { .. }) => {
            match state.snapshot() {
                Ok(snapshot) => {
                    debug!(cursor = %from, tail = %after, "caller outside retained log, sending snapshot");
                    response.snapshot = Some(snapshot);
                }
                Err(e) => error!(error = %e, "failed to snapshot state for catch-up"),
            }
        }
    }
}

impl Service<InboundRequest> for Dispatcher {
    type Response = Dispatched;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inbound: InboundRequest) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.execute(inbound.session, &inbound.request)) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
