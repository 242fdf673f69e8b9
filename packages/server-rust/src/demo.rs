//! Demo resources served by the `test-server` binary and used by the
//! integration suites: a scene list with per-scene instances, and an audio
//! meter that streams levels.
//!
//! Clients build their cache from [`blueprint`] and read locally through
//! [`fallbacks`], the same functions the host getters call.

use std::time::Duration;

use hostlink_core::{
    decode_payload, FallbackError, FallbackTable, ResourceId, StateModule, StateStore,
    StoreBlueprint, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::host::HostBuilder;
use crate::service::{CallContext, Deferred, InvokeError, MethodTable, ResolveError, StreamEmitter};

pub const SCENE_LIST: &str = "SceneList";
pub const SCENE: &str = "Scene";
pub const AUDIO_METER: &str = "AudioMeter";

// ---------------------------------------------------------------------------
// Replicated state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct SceneRef {
    id: String,
}

/// Ordered scene collection. Owns `SceneAdded`, `SceneRemoved` and
/// `SceneRenamed`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneListState {
    pub scenes: Vec<SceneEntry>,
    pub next_index: u64,
}

impl SceneListState {
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SceneEntry> {
        self.scenes.iter().find(|s| s.id == id)
    }

    fn rejected(mutation_type: &str, reason: impl Into<String>) -> StoreError {
        StoreError::Rejected {
            mutation_type: mutation_type.to_string(),
            reason: reason.into(),
        }
    }
}

impl StateModule for SceneListState {
    const NAME: &'static str = "sceneList";

    fn handles(mutation_type: &str) -> bool {
        matches!(mutation_type, "SceneAdded" | "SceneRemoved" | "SceneRenamed")
    }

    fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError> {
        match mutation_type {
            "SceneAdded" => {
                let entry: SceneEntry = decode_payload(mutation_type, payload)?;
                if self.get(&entry.id).is_some() {
                    return Err(Self::rejected(mutation_type, format!("duplicate id {}", entry.id)));
                }
                self.scenes.push(entry);
                self.next_index += 1;
            }
            "SceneRemoved" => {
                let SceneRef { id } = decode_payload(mutation_type, payload)?;
                let before = self.scenes.len();
                self.scenes.retain(|s| s.id != id);
                if self.scenes.len() == before {
                    return Err(Self::rejected(mutation_type, format!("unknown scene {id}")));
                }
            }
            "SceneRenamed" => {
                let SceneEntry { id, name } = decode_payload(mutation_type, payload)?;
                let Some(scene) = self.scenes.iter_mut().find(|s| s.id == id) else {
                    return Err(Self::rejected(mutation_type, format!("unknown scene {id}")));
                };
                scene.name = name;
            }
            other => return Err(StoreError::UnknownMutationType(other.to_string())),
        }
        Ok(())
    }
}

#[must_use]
pub fn blueprint() -> StoreBlueprint {
    StoreBlueprint::new().with::<SceneListState>()
}

// ---------------------------------------------------------------------------
// Local-fallback reads
// ---------------------------------------------------------------------------

fn scene_list(store: &StateStore) -> Result<&SceneListState, FallbackError> {
    store
        .module::<SceneListState>()
        .ok_or(FallbackError::MissingModule(SceneListState::NAME))
}

fn scene_id_arg(args: &[Value]) -> Result<&str, FallbackError> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| FallbackError::InvalidArgs("expected a scene id".to_string()))
}

/// `SceneList.scenes`: every scene in order.
pub fn read_scenes(store: &StateStore, _args: &[Value]) -> Result<Value, FallbackError> {
    Ok(json!(scene_list(store)?.scenes))
}

/// `SceneList.count`.
pub fn read_count(store: &StateStore, _args: &[Value]) -> Result<Value, FallbackError> {
    Ok(json!(scene_list(store)?.scenes.len()))
}

/// `Scene(id).name`.
pub fn read_scene_name(store: &StateStore, args: &[Value]) -> Result<Value, FallbackError> {
    let id = scene_id_arg(args)?;
    scene_list(store)?
        .get(id)
        .map(|s| json!(s.name))
        .ok_or_else(|| FallbackError::NotFound(format!("scene {id}")))
}

/// Local reads clients may answer from their cache.
#[must_use]
pub fn fallbacks() -> FallbackTable {
    FallbackTable::new()
        .with(SCENE_LIST, "scenes", read_scenes)
        .with(SCENE_LIST, "count", read_count)
        .with(SCENE, "name", read_scene_name)
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Singleton managing the collection.
pub struct SceneList;

/// One scene, addressed as `Scene("scene_N")`.
pub struct Scene {
    id: String,
}

/// Singleton streaming synthetic audio levels.
pub struct AudioMeter {
    interval: Duration,
}

fn scene_resource(id: &str) -> Result<ResourceId, InvokeError> {
    ResourceId::instance(SCENE, vec![json!(id)]).map_err(|e| InvokeError::InvalidParams(e.to_string()))
}

fn scene_names(store: &StateStore) -> Vec<String> {
    store
        .module::<SceneListState>()
        .map(|list| list.scenes.iter().map(|s| s.name.clone()).collect())
        .unwrap_or_default()
}

fn finish_export(deferred: Deferred, names: Vec<String>) {
    if names.is_empty() {
        deferred.reject("no scenes to export");
    } else {
        deferred.resolve(names);
    }
}

fn scene_list_table() -> MethodTable<SceneList> {
    MethodTable::new()
        .method("addScene", |_: &SceneList, ctx: &mut CallContext<'_>, (name,): (String,)| {
            let index = ctx
                .state()
                .module::<SceneListState>()
                .map_or(1, |list| list.next_index + 1);
            let id = format!("scene_{index}");
            ctx.commit(
                "SceneAdded",
                SceneEntry {
                    id: id.clone(),
                    name,
                },
            )?;
            Ok(id)
        })
        .method("removeScene", |_: &SceneList, ctx: &mut CallContext<'_>, (id,): (String,)| {
            let scene = scene_resource(&id)?;
            ctx.invoke(&scene, "remove", &[])
        })
        .method("exportScenes", |_: &SceneList, ctx: &mut CallContext<'_>, (): ()| {
            let (handle, deferred) = ctx.deferred();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let shared = ctx.shared();
                    // The state lock blocks; keep it off the async workers.
                    runtime.spawn_blocking(move || {
                        let names = scene_names(shared.lock().store());
                        finish_export(deferred, names);
                    });
                }
                Err(_) => finish_export(deferred, scene_names(ctx.state())),
            }
            Ok(handle.to_value())
        })
        .fallback_getter("scenes", read_scenes)
        .fallback_getter("count", read_count)
}

fn scene_table() -> MethodTable<Scene> {
    MethodTable::new()
        .method("rename", |scene: &Scene, ctx: &mut CallContext<'_>, (name,): (String,)| {
            ctx.commit(
                "SceneRenamed",
                SceneEntry {
                    id: scene.id.clone(),
                    name,
                },
            )?;
            Ok(())
        })
        .method("remove", |scene: &Scene, ctx: &mut CallContext<'_>, (): ()| {
            ctx.commit("SceneRemoved", json!({ "id": scene.id }))?;
            Ok(true)
        })
        .getter("id", |scene: &Scene, _ctx: &CallContext<'_>| Ok(scene.id.clone()))
        .fallback_getter("name", read_scene_name)
}

fn level(step: u32, count: u32) -> f64 {
    if count == 0 {
        return 0.0;
    }
    f64::from(step + 1) / f64::from(count)
}

fn stream_levels(emitter: StreamEmitter, count: u32, interval: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                for step in 0..count {
                    ticker.tick().await;
                    if !emitter.emit(level(step, count)) {
                        return;
                    }
                }
                emitter.close();
            });
        }
        Err(_) => {
            for step in 0..count {
                emitter.emit(level(step, count));
            }
            emitter.close();
        }
    }
}

fn audio_meter_table() -> MethodTable<AudioMeter> {
    MethodTable::new().method(
        "watchLevels",
        |meter: &AudioMeter, ctx: &mut CallContext<'_>, (count,): (Option<u32>,)| {
            let (handle, emitter) = ctx.stream();
            stream_levels(emitter, count.unwrap_or(u32::MAX), meter.interval);
            Ok::<Value, InvokeError>(handle.to_value())
        },
    )
}

/// Registers the demo resources on `builder`.
#[must_use]
pub fn register(builder: HostBuilder) -> HostBuilder {
    builder
        .singleton(SCENE_LIST, scene_list_table(), || SceneList)
        .instance(SCENE, scene_table(), |(id,): (String,), store: &StateStore| {
            let exists = store
                .module::<SceneListState>()
                .is_some_and(|list| list.get(&id).is_some());
            if exists {
                Ok(Scene { id })
            } else {
                Err(ResolveError::not_found(format!("scene {id}")))
            }
        })
        .singleton(AUDIO_METER, audio_meter_table(), || AudioMeter {
            interval: Duration::from_millis(10),
        })
}

#[cfg(test)]
mod tests {
    use hostlink_core::{codec, ErrorCode, MutationId, Request, SubscriptionHandle, WireFormat};

    use super::*;
    use crate::host::Host;
    use crate::network::session::{OutboundMessage, SessionKind};

    fn host() -> Host {
        register(HostBuilder::new(blueprint())).build()
    }

    async fn call(host: &Host, resource: &str, method: &str, args: Vec<Value>) -> hostlink_core::Response {
        host.call(Request::new("t", ResourceId::parse(resource).unwrap(), method, args))
            .await
    }

    #[tokio::test]
    async fn add_scene_commits_scene_added() {
        let host = host();
        let resp = call(&host, SCENE_LIST, "addScene", vec![json!("Scene A")]).await;
        assert_eq!(resp.result, Some(json!("scene_1")));
        let mutations = resp.mutations.unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].id, MutationId(1));
        assert_eq!(mutations[0].mutation_type, "SceneAdded");
        assert_eq!(mutations[0].payload, json!({ "id": "scene_1", "name": "Scene A" }));
    }

    #[tokio::test]
    async fn scene_ids_are_never_reused() {
        let host = host();
        call(&host, SCENE_LIST, "addScene", vec![json!("A")]).await;
        call(&host, SCENE_LIST, "removeScene", vec![json!("scene_1")]).await;
        let resp = call(&host, SCENE_LIST, "addScene", vec![json!("B")]).await;
        assert_eq!(resp.result, Some(json!("scene_2")));
    }

    #[tokio::test]
    async fn deleted_scene_is_not_found() {
        let host = host();
        call(&host, SCENE_LIST, "addScene", vec![json!("A")]).await;
        let resp = call(&host, r#"Scene("scene_1")"#, "remove", vec![]).await;
        assert_eq!(resp.result, Some(json!(true)));

        let resp = call(&host, r#"Scene("scene_1")"#, "rename", vec![json!("X")]).await;
        assert_eq!(resp.error.unwrap().kind(), Some(ErrorCode::ResourceNotFound));
        let resp = call(&host, SCENE_LIST, "removeScene", vec![json!("scene_1")]).await;
        assert_eq!(resp.error.unwrap().kind(), Some(ErrorCode::ResourceNotFound));
    }

    #[tokio::test]
    async fn getters_match_local_fallbacks() {
        let host = host();
        call(&host, SCENE_LIST, "addScene", vec![json!("A")]).await;
        call(&host, r#"Scene("scene_1")"#, "rename", vec![json!("Renamed")]).await;

        let remote = host
            .call(Request::property("p", ResourceId::parse(r#"Scene("scene_1")"#).unwrap(), "name"))
            .await
            .result
            .unwrap();
        let guard = host.state().lock();
        let local = fallbacks().get(SCENE, "name").unwrap()(guard.store(), &[json!("scene_1")]).unwrap();
        assert_eq!(remote, local);
        assert_eq!(local, json!("Renamed"));
    }

    #[test]
    fn fallbacks_report_missing_scenes() {
        let store = blueprint().build();
        assert_eq!(
            read_scene_name(&store, &[json!("scene_9")]),
            Err(FallbackError::NotFound("scene scene_9".to_string()))
        );
        assert!(matches!(
            read_scene_name(&store, &[]),
            Err(FallbackError::InvalidArgs(_))
        ));
        assert_eq!(read_count(&store, &[]), Ok(json!(0)));
    }

    #[test]
    fn module_rejects_inconsistent_mutations() {
        let mut state = SceneListState::default();
        assert!(state.apply("SceneRemoved", &json!({ "id": "scene_1" })).is_err());
        state
            .apply("SceneAdded", &json!({ "id": "scene_1", "name": "A" }))
            .unwrap();
        assert!(state
            .apply("SceneAdded", &json!({ "id": "scene_1", "name": "B" }))
            .is_err());
        assert_eq!(state.next_index, 1);
    }

    #[tokio::test]
    async fn export_of_empty_list_is_rejected_handle() {
        let host = host();
        let resp = call(&host, SCENE_LIST, "exportScenes", vec![]).await;
        assert!(resp.error.is_none());
        assert!(SubscriptionHandle::from_value(&resp.result.unwrap()).is_some());
    }

    #[allow(clippy::await_holding_lock)]
    #[tokio::test(flavor = "current_thread")]
    async fn export_waits_for_the_state_lock_off_the_runtime() {
        let host = host();
        call(&host, SCENE_LIST, "addScene", vec![json!("A")]).await;
        let (session, mut rx) = host.attach(SessionKind::Main, WireFormat::Json);
        let req = Request::new("x", ResourceId::parse(SCENE_LIST).unwrap(), "exportScenes", vec![]);
        let bytes = codec::encode(&req, WireFormat::Json).unwrap();
        host.serve_frame(&session, &bytes, WireFormat::Json).await;

        let guard = host.state().lock();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let mut frames = Vec::new();
        while frames.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(OutboundMessage::Frame(resp))) => frames.push(*resp),
                other => panic!("expected a frame, got {other:?}"),
            }
        }
        let event = frames[1].event.as_ref().unwrap();
        assert!(!event.rejected());
        assert_eq!(event.data, json!(["A"]));
    }

    #[test]
    fn levels_ramp_to_one() {
        assert!((level(0, 4) - 0.25).abs() < f64::EPSILON);
        assert!((level(3, 4) - 1.0).abs() < f64::EPSILON);
        assert!(level(0, 0).abs() < f64::EPSILON);
    }
}
