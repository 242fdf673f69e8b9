//! hostlink host: authoritative state, resource dispatch and session
//! transports for companion processes.

pub mod demo;
pub mod host;
pub mod network;
pub mod service;
pub mod state;

pub use host::{Host, HostBuilder};
pub use network::{LocalConnection, NetworkConfig, NetworkModule, SessionId, SessionKind};
pub use service::{
    CallContext, Deferred, HostConfig, InvokeError, MethodTable, ResolveError, StreamEmitter,
};
pub use state::{HostState, SharedState};
