//! hostlink client: presents host resources as local objects and mirrors
//! host state from the mutation log.
//!
//! ```ignore
//! let (to_host, from_host) = host.connect_local(SessionKind::Child, WireFormat::Json).into_parts();
//! let client = HostClient::connect(
//!     ChannelTransport::new(WireFormat::Json, to_host, from_host),
//!     blueprint(),
//!     fallbacks(),
//!     ClientConfig::default(),
//! );
//! let id: String = client.resource("SceneList")?.call("addScene", vec!["Intro".into()]).await?;
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod proxy;
pub mod subscription;
pub mod transport;

pub use cache::LocalCache;
pub use client::{CallOptions, HostClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use proxy::ResourceProxy;
pub use subscription::{DeferredHandle, StreamSubscription};
pub use transport::{ChannelTransport, ClientTransport, WebSocketTransport};
