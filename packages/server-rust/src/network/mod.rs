//! Transports, sessions and shutdown control.

pub mod config;
pub mod handlers;
pub mod local;
pub mod middleware;
pub mod module;
pub mod session;
pub mod shutdown;

pub use config::*;
pub use handlers::AppState;
pub use local::LocalConnection;
pub use module::NetworkModule;
pub use session::*;
pub use shutdown::*;
