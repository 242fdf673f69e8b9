//! Built-in `Host` resource: state baselines, catch-up and subscription
//! management for clients.

use hostlink_core::{MutationId, ResourceId};
use serde::Serialize;
use serde_json::Value;

use super::registry::ResourceRegistry;
use super::resource::{CallContext, InvokeError, MethodTable};
use crate::state::LogError;

/// Name under which the control resource is registered.
pub const CONTROL_RESOURCE: &str = "Host";

/// Marker type for the control resource; all state lives in the context.
pub struct HostControl;

/// Result of `Host.getMutations`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CatchUp {
    Mutations {
        #[serde(rename = "mutationId")]
        mutation_id: MutationId,
        mutations: Vec<hostlink_core::Mutation>,
    },
    Snapshot {
        snapshot: hostlink_core::Snapshot,
    },
}

fn catch_up(ctx: &CallContext<'_>, since: MutationId) -> Result<CatchUp, InvokeError> {
    match ctx.log().since(since) {
        Ok(mutations) => Ok(CatchUp::Mutations {
            mutation_id: ctx.tail(),
            mutations,
        }),
        Err(LogError::Compacted { .. } | LogError::AheadOfTail { .. }) => Ok(CatchUp::Snapshot {
            snapshot: ctx.snapshot()?,
        }),
    }
}

#[must_use]
pub fn control_table() -> MethodTable<HostControl> {
    MethodTable::new()
        .method("getSnapshot", |_: &HostControl, ctx: &mut CallContext<'_>, (): ()| {
            ctx.snapshot()
        })
        .method(
            "getMutations",
            |_: &HostControl, ctx: &mut CallContext<'_>, (since,): (Option<MutationId>,)| {
                catch_up(ctx, since.unwrap_or(MutationId::ZERO))
            },
        )
        .method(
            "unsubscribe",
            |_: &HostControl, ctx: &mut CallContext<'_>, (handle,): (String,)| {
                let id = ResourceId::parse(&handle)
                    .map_err(|e| InvokeError::InvalidParams(e.to_string()))?;
                Ok(ctx.unsubscribe(&id))
            },
        )
        .method("watchMutations", |_: &HostControl, ctx: &mut CallContext<'_>, (): ()| {
            let (handle, emitter) = ctx.stream();
            ctx.watch_mutations(emitter);
            Ok::<Value, InvokeError>(handle.to_value())
        })
        .getter("tail", |_: &HostControl, ctx: &CallContext<'_>| Ok(ctx.tail()))
}

/// Registers the control resource on `registry`.
pub fn register(registry: &ResourceRegistry) {
    registry.register_singleton(CONTROL_RESOURCE, control_table(), || HostControl);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostlink_core::{
        decode_payload, Request, StateModule, StoreBlueprint, StoreError, SubscriptionHandle,
    };
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::network::session::SessionRegistry;
    use crate::service::dispatch::Dispatcher;
    use crate::service::events::EventMultiplexer;
    use crate::state::{HostState, SharedState};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl StateModule for Counter {
        const NAME: &'static str = "counter";

        fn handles(mutation_type: &str) -> bool {
            mutation_type == "Bumped"
        }

        fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError> {
            self.value += decode_payload::<i64>(mutation_type, payload)?;
            Ok(())
        }
    }

    fn setup() -> (Dispatcher, SharedState, Arc<EventMultiplexer>) {
        let state = SharedState::new(HostState::new(&StoreBlueprint::new().with::<Counter>()));
        let registry = Arc::new(ResourceRegistry::new());
        register(&registry);
        let events = Arc::new(EventMultiplexer::new(Arc::new(SessionRegistry::new())));
        let dispatcher = Dispatcher::new(state.clone(), registry, Arc::clone(&events));
        (dispatcher, state, events)
    }

    fn host_call(d: &Dispatcher, method: &str, args: Vec<Value>) -> Value {
        let mut req = Request::new(
            "c",
            ResourceId::parse(CONTROL_RESOURCE).unwrap(),
            method,
            args,
        );
        req.params.compact_mode = true;
        let resp = d.execute(None, &req).response;
        assert!(resp.error.is_none(), "{:?}", resp.error);
        resp.result.unwrap_or(Value::Null)
    }

    #[test]
    fn snapshot_and_tail() {
        let (d, state, _) = setup();
        state.commit("Bumped", json!(4)).unwrap();
        let snap = host_call(&d, "getSnapshot", vec![]);
        assert_eq!(snap["mutationId"], json!(1));
        assert_eq!(snap["modules"]["counter"]["value"], json!(4));

        let resp = d
            .execute(
                None,
                &Request::property("t", ResourceId::parse("Host").unwrap(), "tail"),
            )
            .response;
        assert_eq!(resp.result, Some(json!(1)));
    }

    #[test]
    fn get_mutations_returns_suffix_or_snapshot() {
        let (d, state, _) = setup();
        for i in 1..=3 {
            state.commit("Bumped", json!(i)).unwrap();
        }
        let out = host_call(&d, "getMutations", vec![json!(1)]);
        assert_eq!(out["mutationId"], json!(3));
        assert_eq!(out["mutations"].as_array().unwrap().len(), 2);

        state.lock().compact(MutationId(2));
        let out = host_call(&d, "getMutations", vec![json!(0)]);
        assert_eq!(out["snapshot"]["modules"]["counter"]["value"], json!(6));
        assert!(out.get("mutations").is_none());
    }

    #[test]
    fn unsubscribe_by_handle_string() {
        let (d, _, events) = setup();
        let value = host_call(&d, "watchMutations", vec![]);
        let handle = SubscriptionHandle::from_value(&value).unwrap();
        assert!(events.is_active(&handle.resource_id));

        let removed = host_call(&d, "unsubscribe", vec![json!(handle.resource_id.as_str())]);
        assert_eq!(removed, json!(true));
        assert!(!events.is_active(&handle.resource_id));
        assert_eq!(host_call(&d, "unsubscribe", vec![json!(handle.resource_id.as_str())]), json!(false));
    }

    #[test]
    fn watchers_are_pruned_once_unsubscribed() {
        let (d, state, events) = setup();
        let value = host_call(&d, "watchMutations", vec![]);
        let handle = SubscriptionHandle::from_value(&value).unwrap();
        assert_eq!(state.lock().watcher_count(), 1);

        events.unsubscribe(&handle.resource_id, None);
        state.commit("Bumped", json!(1)).unwrap();
        assert_eq!(state.lock().watcher_count(), 0);
    }
}
