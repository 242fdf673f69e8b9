//! Network module with deferred startup lifecycle.
//!
//! `new()` wires the host into shared state, `start()` binds the TCP
//! listener, and `serve()` accepts connections until shutdown. Callers can
//! read the bound port between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, rpc_handler, ws_upgrade_handler,
    AppState,
};
use super::middleware::{rpc_timeout, with_http_layers};
use super::shutdown::ShutdownController;
use crate::host::Host;

/// Manages the HTTP/WebSocket server lifecycle for one host.
///
/// 1. `new()` -- captures the host and its shutdown controller
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    host: Host,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, host: Host) -> Self {
        let shutdown = host.shutdown_controller();
        Self {
            config,
            listener: None,
            host,
            shutdown,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness check
    /// - `GET /health/ready` -- readiness check
    /// - `GET /ws` -- WebSocket session (`?format=json|msgpack&kind=main|child|worker`)
    /// - `POST /rpc` -- one-shot request without a session
    pub fn build_router(&self) -> Router {
        let state = AppState {
            host: self.host.clone(),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        let routes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/ws", get(ws_upgrade_handler))
            .route(
                "/rpc",
                post(rpc_handler).layer(rpc_timeout(self.config.request_timeout)),
            );
        with_http_layers(routes, &self.config).with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured
    /// port when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves, then drains.
    ///
    /// The signal starts the host's drain, which stops WebSocket loops so the
    /// listener can finish; [`Host::drain`] then closes whatever sessions are
    /// left and waits up to `drain_timeout` for frames in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };

        self.shutdown.set_ready();

        let ctrl = Arc::clone(&self.shutdown);
        let signal = async move {
            shutdown.await;
            ctrl.begin_drain();
        };

        info!("Serving HTTP/WS connections");
        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        self.host.drain(self.config.drain_timeout).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::host::HostBuilder;
    use crate::network::HealthState;

    fn module() -> NetworkModule {
        let host = demo::register(HostBuilder::new(demo::blueprint())).build();
        NetworkModule::new(NetworkConfig::default(), host)
    }

    #[test]
    fn new_creates_module_without_binding() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn shutdown_controller_is_the_hosts() {
        let module = module();
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.host.shutdown_controller()
        ));
    }

    #[test]
    fn build_router_creates_router() {
        let _router = module().build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module().serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_on_signal() {
        let mut module = module();
        module.start().await.unwrap();
        let ctrl = module.shutdown_controller();
        module.serve(async {}).await.unwrap();
        assert_eq!(ctrl.health_state(), HealthState::Stopped);
    }
}
