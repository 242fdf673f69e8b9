//! Wire envelope shared by the host and its clients.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON and
//! named `MsgPack` encodings match the field names of the envelope exactly.

pub mod error;
pub mod event;
pub mod request;
pub mod response;

pub use error::{ErrorCode, ErrorPayload};
pub use event::{EmitterKind, Event, SubscriptionHandle};
pub use request::{Request, RequestParams, RequestRejection, PROPERTY_READ_METHOD};
pub use response::Response;
