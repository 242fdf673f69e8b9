//! hostlink core: resource identifiers, the request/response/event envelope,
//! mutations, and the replicated state model shared by host and clients.

pub mod codec;
pub mod fallback;
pub mod messages;
pub mod mutation;
pub mod resource;
pub mod store;

pub use codec::{CodecError, WireFormat};
pub use fallback::{FallbackError, FallbackFn, FallbackTable};
pub use messages::{
    EmitterKind, ErrorCode, ErrorPayload, Event, Request, RequestParams, Response,
    SubscriptionHandle, PROPERTY_READ_METHOD,
};
pub use mutation::{Mutation, MutationId};
pub use resource::{ResourceId, ResourceIdError};
pub use store::{decode_payload, Snapshot, StateModule, StateStore, StoreBlueprint, StoreError};
