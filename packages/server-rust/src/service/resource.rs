//! Remote-callable resources and the context an invocation runs in.
//!
//! A resource is anything the registry can hand the dispatcher: a singleton
//! service or a per-instance helper. Most resources are plain structs paired
//! with a [`MethodTable`], which decodes positional arguments into typed
//! tuples and encodes results with serde.

use std::collections::HashMap;
use std::sync::Arc;

use hostlink_core::{
    ErrorCode, FallbackError, FallbackFn, Mutation, MutationId, ResourceId, Snapshot, StateStore,
    StoreError, SubscriptionHandle, PROPERTY_READ_METHOD,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::events::{Deferred, EventMultiplexer, StreamEmitter};
use super::registry::{ResolveError, ResourceRegistry};
use crate::network::session::SessionId;
use crate::state::{HostState, MutationLog, SharedState};

/// Nested `CallContext::invoke` calls deeper than this fail instead of
/// overflowing the stack.
pub const MAX_CALL_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// InvokeError
// ---------------------------------------------------------------------------

/// Failure of a single invocation, mapped to a wire error code.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("{resource} has no method {method:?}")]
    MethodNotFound { resource: String, method: String },
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The entity behind the resource disappeared during the call.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("result could not be encoded: {0}")]
    Encode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl InvokeError {
    /// Business-logic failure with a message.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        InvokeError::Failed(anyhow::anyhow!("{message}"))
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            InvokeError::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            InvokeError::InvalidParams(_) => ErrorCode::InvalidParams,
            InvokeError::Resolve(e) => e.code(),
            InvokeError::NotFound(_) => ErrorCode::ResourceNotFound,
            InvokeError::Encode(_) => ErrorCode::InternalJsonRpcError,
            InvokeError::Store(_) | InvokeError::Failed(_) => ErrorCode::InternalServerError,
        }
    }
}

impl From<FallbackError> for InvokeError {
    fn from(e: FallbackError) -> Self {
        match e {
            FallbackError::NotFound(what) => InvokeError::NotFound(what),
            FallbackError::InvalidArgs(reason) => InvokeError::InvalidParams(reason),
            FallbackError::MissingModule(_) => InvokeError::Failed(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource trait
// ---------------------------------------------------------------------------

/// Something the dispatcher can invoke methods on.
pub trait Resource: Send + Sync + 'static {
    /// Service name this resource was registered under.
    fn name(&self) -> &str;

    /// Runs one method. Property reads arrive as `PROPERTY_READ_METHOD` with
    /// the property name as the first argument.
    ///
    /// # Errors
    ///
    /// Returns an `InvokeError` describing why the call failed.
    fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, InvokeError>;

    /// Releases held resources. Called for singletons at host shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails; shutdown continues regardless.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FromArgs
// ---------------------------------------------------------------------------

/// Decodes the positional argument list of a call.
///
/// Implemented for `()`, tuples of up to five `DeserializeOwned` values, and
/// `Vec<Value>` (raw pass-through). Missing trailing arguments decode from
/// `null`, so `Option` parameters may be omitted.
pub trait FromArgs: Sized {
    /// # Errors
    ///
    /// Returns `InvokeError::InvalidParams` on arity or type mismatch.
    fn from_args(args: &[Value]) -> Result<Self, InvokeError>;
}

impl FromArgs for () {
    fn from_args(args: &[Value]) -> Result<Self, InvokeError> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(InvokeError::InvalidParams(format!(
                "expected no arguments, got {}",
                args.len()
            )))
        }
    }
}

impl FromArgs for Vec<Value> {
    fn from_args(args: &[Value]) -> Result<Self, InvokeError> {
        Ok(args.to_vec())
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, InvokeError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| InvokeError::InvalidParams(format!("argument {index}: {e}")))
}

macro_rules! tuple_from_args {
    ($len:expr; $($ty:ident : $idx:tt),+) => {
        impl<$($ty: DeserializeOwned),+> FromArgs for ($($ty,)+) {
            fn from_args(args: &[Value]) -> Result<Self, InvokeError> {
                if args.len() > $len {
                    return Err(InvokeError::InvalidParams(format!(
                        "expected at most {} arguments, got {}",
                        $len,
                        args.len()
                    )));
                }
                Ok(($(arg::<$ty>(args, $idx)?,)+))
            }
        }
    };
}

tuple_from_args!(1; A: 0);
tuple_from_args!(2; A: 0, B: 1);
tuple_from_args!(3; A: 0, B: 1, C: 2);
tuple_from_args!(4; A: 0, B: 1, C: 2, D: 3);
tuple_from_args!(5; A: 0, B: 1, C: 2, D: 3, E: 4);

// ---------------------------------------------------------------------------
// MethodTable
// ---------------------------------------------------------------------------

type Handler<R> =
    Box<dyn Fn(&R, &mut CallContext<'_>, &[Value]) -> Result<Value, InvokeError> + Send + Sync>;
type ShutdownHook<R> = Box<dyn Fn(&R) -> anyhow::Result<()> + Send + Sync>;

fn encode_result<T: Serialize>(value: &T) -> Result<Value, InvokeError> {
    serde_json::to_value(value).map_err(|e| InvokeError::Encode(e.to_string()))
}

/// Typed interface of one resource type: named methods and readable
/// properties.
pub struct MethodTable<R> {
    methods: HashMap<&'static str, Handler<R>>,
    getters: HashMap<&'static str, Handler<R>>,
    on_shutdown: Option<ShutdownHook<R>>,
}

impl<R: Send + Sync + 'static> MethodTable<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            getters: HashMap::new(),
            on_shutdown: None,
        }
    }

    /// Registers a method whose arguments decode into `A`.
    #[must_use]
    pub fn method<A, T, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: FromArgs,
        T: Serialize,
        F: Fn(&R, &mut CallContext<'_>, A) -> Result<T, InvokeError> + Send + Sync + 'static,
    {
        self.methods.insert(
            name,
            Box::new(
                move |target: &R, ctx: &mut CallContext<'_>, args: &[Value]| {
                    let decoded = A::from_args(args)?;
                    encode_result(&handler(target, ctx, decoded)?)
                },
            ),
        );
        self
    }

    /// Registers a readable property.
    #[must_use]
    pub fn getter<T, F>(mut self, name: &'static str, handler: F) -> Self
    where
        T: Serialize,
        F: Fn(&R, &CallContext<'_>) -> Result<T, InvokeError> + Send + Sync + 'static,
    {
        self.getters.insert(
            name,
            Box::new(
                move |target: &R, ctx: &mut CallContext<'_>, _args: &[Value]| {
                    encode_result(&handler(target, ctx)?)
                },
            ),
        );
        self
    }

    /// Registers a property answered by a local-fallback read, the same
    /// function clients run against their cache.
    #[must_use]
    pub fn fallback_getter(self, name: &'static str, read: FallbackFn) -> Self {
        self.getter(name, move |_target: &R, ctx: &CallContext<'_>| {
            let args = ctx.resource().args().unwrap_or(&[]);
            read(ctx.state(), args).map_err(InvokeError::from)
        })
    }

    /// Hook run when the host shuts the resource down.
    #[must_use]
    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: Fn(&R) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    #[must_use]
    pub fn has_property(&self, name: &str) -> bool {
        self.getters.contains_key(name)
    }

    /// Routes a call to the matching method or property.
    ///
    /// # Errors
    ///
    /// `MethodNotFound` for unknown names, `InvalidParams` for argument
    /// mismatches, or whatever the handler returns.
    pub fn dispatch(
        &self,
        target: &R,
        ctx: &mut CallContext<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        if method == PROPERTY_READ_METHOD {
            let Some(property) = args.first().and_then(Value::as_str) else {
                return Err(InvokeError::InvalidParams(
                    "property read expects the property name".to_string(),
                ));
            };
            let getter = self.getters.get(property).ok_or_else(|| InvokeError::MethodNotFound {
                resource: ctx.resource().to_string(),
                method: format!("{PROPERTY_READ_METHOD}({property})"),
            })?;
            return getter(target, ctx, &args[1..]);
        }

        let handler = self.methods.get(method).ok_or_else(|| InvokeError::MethodNotFound {
            resource: ctx.resource().to_string(),
            method: method.to_string(),
        })?;
        handler(target, ctx, args)
    }
}

impl<R: Send + Sync + 'static> Default for MethodTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A plain value bound to its method table.
pub(crate) struct Bound<R> {
    pub(crate) name: String,
    pub(crate) target: R,
    pub(crate) table: Arc<MethodTable<R>>,
}

impl<R: Send + Sync + 'static> Resource for Bound<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        self.table.dispatch(&self.target, ctx, method, args)
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        match &self.table.on_shutdown {
            Some(hook) => hook(&self.target),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Everything an invocation may touch.
///
/// Holds exclusive access to the host state for the duration of the call.
/// Resources read replicated state through [`CallContext::state`] and change
/// it only through [`CallContext::commit`].
pub struct CallContext<'a> {
    state: &'a mut HostState,
    registry: &'a ResourceRegistry,
    events: &'a Arc<EventMultiplexer>,
    shared: &'a SharedState,
    session: Option<SessionId>,
    window_id: Option<&'a str>,
    resource: ResourceId,
    depth: usize,
    created: Vec<ResourceId>,
}

impl<'a> CallContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: &'a mut HostState,
        registry: &'a ResourceRegistry,
        events: &'a Arc<EventMultiplexer>,
        shared: &'a SharedState,
        session: Option<SessionId>,
        window_id: Option<&'a str>,
        resource: ResourceId,
    ) -> Self {
        Self {
            state,
            registry,
            events,
            shared,
            session,
            window_id,
            resource,
            depth: 0,
            created: Vec::new(),
        }
    }

    /// The resource currently being invoked.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Session that issued the request, `None` for host-internal calls.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    #[must_use]
    pub fn window_id(&self) -> Option<&str> {
        self.window_id
    }

    /// Read access to replicated state.
    #[must_use]
    pub fn state(&self) -> &StateStore {
        self.state.store()
    }

    #[must_use]
    pub fn log(&self) -> &MutationLog {
        self.state.log()
    }

    #[must_use]
    pub fn tail(&self) -> MutationId {
        self.state.tail()
    }

    /// # Errors
    ///
    /// Returns `InvokeError::Store` if a module fails to serialize.
    pub fn snapshot(&self) -> Result<Snapshot, InvokeError> {
        Ok(self.state.snapshot()?)
    }

    /// Commits one mutation: applied to the store and appended to the log.
    ///
    /// # Errors
    ///
    /// `InvokeError::Encode` if the payload cannot be serialized,
    /// `InvokeError::Store` if no state module accepts it.
    pub fn commit(
        &mut self,
        mutation_type: &str,
        payload: impl Serialize,
    ) -> Result<Mutation, InvokeError> {
        let payload = encode_result(&payload)?;
        Ok(self.state.commit(mutation_type, payload)?)
    }

    /// Synchronously invokes another resource within the same call.
    ///
    /// # Errors
    ///
    /// Resolution or invocation failures of the nested call.
    pub fn invoke(
        &mut self,
        resource: &ResourceId,
        method: &str,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(InvokeError::failed(format!(
                "nested call depth exceeded {MAX_CALL_DEPTH} at {resource}.{method}"
            )));
        }
        let target = self.registry.resolve(resource, self.state.store())?;

        let caller = std::mem::replace(&mut self.resource, resource.clone());
        self.depth += 1;
        let result = target.invoke(self, method, args);
        self.depth -= 1;
        self.resource = caller;
        result
    }

    /// Reads a property of another resource.
    ///
    /// # Errors
    ///
    /// As for [`CallContext::invoke`].
    pub fn get(&mut self, resource: &ResourceId, property: &str) -> Result<Value, InvokeError> {
        self.invoke(
            resource,
            PROPERTY_READ_METHOD,
            &[Value::String(property.to_string())],
        )
    }

    /// Creates a single-fulfilment handle owned by the calling session.
    /// Return `handle.to_value()` as the call result.
    pub fn deferred(&mut self) -> (SubscriptionHandle, Deferred) {
        let (handle, deferred) = self.events.deferred(self.session);
        self.created.push(handle.resource_id.clone());
        (handle, deferred)
    }

    /// Creates a stream handle owned by the calling session.
    pub fn stream(&mut self) -> (SubscriptionHandle, StreamEmitter) {
        let (handle, emitter) = self.events.stream(self.session);
        self.created.push(handle.resource_id.clone());
        (handle, emitter)
    }

    /// Feeds every future committed mutation into `emitter`.
    pub fn watch_mutations(&mut self, emitter: StreamEmitter) {
        self.state.watch(emitter);
    }

    /// Ends a subscription owned by the calling session.
    pub fn unsubscribe(&mut self, handle: &ResourceId) -> bool {
        self.events.unsubscribe(handle, self.session)
    }

    /// Handle for work that finishes after this call returns.
    #[must_use]
    pub fn shared(&self) -> SharedState {
        self.shared.clone()
    }

    /// Handles created during this call, to be announced after the response.
    pub(crate) fn into_created(self) -> Vec<ResourceId> {
        self.created
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unit_rejects_arguments() {
        assert!(<()>::from_args(&[]).is_ok());
        let err = <()>::from_args(&[json!(1)]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams);
    }

    #[test]
    fn tuples_decode_positionally() {
        let (name, count): (String, u32) = FromArgs::from_args(&[json!("a"), json!(3)]).unwrap();
        assert_eq!(name, "a");
        assert_eq!(count, 3);
    }

    #[test]
    fn missing_trailing_option_decodes_as_none() {
        let (name, limit): (String, Option<u32>) = FromArgs::from_args(&[json!("a")]).unwrap();
        assert_eq!(name, "a");
        assert_eq!(limit, None);
    }

    #[test]
    fn type_and_arity_mismatches_are_invalid_params() {
        let wrong_type = <(u32,)>::from_args(&[json!("nope")]).unwrap_err();
        assert_eq!(wrong_type.code(), ErrorCode::InvalidParams);

        let too_many = <(u32,)>::from_args(&[json!(1), json!(2)]).unwrap_err();
        assert!(too_many.to_string().contains("at most 1"));

        let missing = <(u32,)>::from_args(&[]).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::InvalidParams);
    }

    #[test]
    fn raw_args_pass_through() {
        let raw: Vec<Value> = FromArgs::from_args(&[json!(1), json!("x")]).unwrap();
        assert_eq!(raw, vec![json!(1), json!("x")]);
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            InvokeError::NotFound("x".into()).code(),
            ErrorCode::ResourceNotFound
        );
        assert_eq!(
            InvokeError::failed("boom").code(),
            ErrorCode::InternalServerError
        );
        assert_eq!(
            InvokeError::Encode("bad".into()).code(),
            ErrorCode::InternalJsonRpcError
        );
        assert_eq!(
            InvokeError::from(FallbackError::NotFound("gone".into())).code(),
            ErrorCode::ResourceNotFound
        );
        assert_eq!(InvokeError::failed("boom").to_string(), "boom");
    }

    #[test]
    fn table_reports_registered_names() {
        struct Svc;
        let table = MethodTable::<Svc>::new()
            .method("ping", |_svc: &Svc, _ctx: &mut CallContext<'_>, (): ()| Ok("pong"))
            .getter("ready", |_svc: &Svc, _ctx: &CallContext<'_>| Ok(true));
        assert!(table.has_method("ping"));
        assert!(!table.has_method("ready"));
        assert!(table.has_property("ready"));
    }
}
