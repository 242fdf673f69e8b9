//! Pipeline composition: wraps the dispatcher with the middleware layers.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::service::config::HostConfig;
use crate::service::dispatch::Dispatcher;

/// The composed dispatch service.
pub type DispatchPipeline = LoadShedService<MetricsService<Dispatcher>>;

/// Builds the dispatch pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded, before any work
/// 2. `MetricsLayer` -- record timing and outcome
#[must_use]
pub fn build_dispatch_pipeline(dispatcher: Dispatcher, config: &HostConfig) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_requests))
        .layer(MetricsLayer)
        .service(dispatcher)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostlink_core::{Request, ResourceId, StoreBlueprint};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::network::session::SessionRegistry;
    use crate::service::control;
    use crate::service::dispatch::InboundRequest;
    use crate::service::events::EventMultiplexer;
    use crate::service::registry::ResourceRegistry;
    use crate::state::{HostState, SharedState};

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let registry = Arc::new(ResourceRegistry::new());
        control::register(&registry);
        let dispatcher = Dispatcher::new(
            SharedState::new(HostState::new(&StoreBlueprint::new())),
            registry,
            Arc::new(EventMultiplexer::new(Arc::new(SessionRegistry::new()))),
        );

        let config = HostConfig {
            max_concurrent_requests: 100,
            ..HostConfig::default()
        };
        let svc = build_dispatch_pipeline(dispatcher, &config);
        let out = svc
            .oneshot(InboundRequest {
                session: None,
                request: Request::property("p", ResourceId::parse("Host").unwrap(), "tail"),
            })
            .await
            .unwrap();
        assert_eq!(out.response.result, Some(json!(0)));
    }
}
