//! Resource dispatch framework.
//!
//! 1. **Resources** (`resource`, `registry`): typed method tables bound to
//!    singleton or per-instance resources, resolved by identifier
//! 2. **Dispatch** (`dispatch`): one request in, one response out, with
//!    catch-up mutations attached
//! 3. **Middleware** (`middleware`): Tower layers (metrics, load-shedding)
//! 4. **Events** (`events`): deferred and stream subscription handles
//! 5. **Control** (`control`): the built-in `Host` resource
//! 6. **Background workers** (`worker`): mutation log compaction

pub mod config;
pub mod control;
pub mod dispatch;
pub mod events;
pub mod middleware;
pub mod registry;
pub mod resource;
pub mod worker;

pub use config::{HostConfig, RetentionConfig};
pub use control::CONTROL_RESOURCE;
pub use dispatch::{DispatchError, Dispatched, Dispatcher, InboundRequest};
pub use events::{Deferred, EventMultiplexer, StreamEmitter};
pub use registry::{ResolveError, ResourceFactory, ResourceRegistry};
pub use resource::{CallContext, FromArgs, InvokeError, MethodTable, Resource};
pub use worker::{BackgroundRunnable, BackgroundWorker, CompactionRunnable, CompactionTask};
