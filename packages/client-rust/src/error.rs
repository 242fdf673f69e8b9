//! Client-side error type.

use std::time::Duration;

use hostlink_core::{CodecError, EmitterKind, ErrorCode, ErrorPayload, ResourceIdError, StoreError};

/// Failure of a client operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The host answered the call with an error.
    #[error("host error: {0}")]
    Host(ErrorPayload),
    /// A deferred result was rejected by the host.
    #[error("asynchronous result rejected: {0}")]
    Rejected(ErrorPayload),
    /// The transport closed; pending calls will never be answered.
    #[error("disconnected from host")]
    Disconnected,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The call returned something other than the expected handle kind.
    #[error("expected a {0:?} subscription handle")]
    NotSubscription(EmitterKind),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A result did not have the shape the caller asked for.
    #[error("unexpected result: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Cache(#[from] StoreError),
    #[error(transparent)]
    Resource(#[from] ResourceIdError),
}

impl ClientError {
    /// Wire error code carried by host-side failures.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Host(e) | ClientError::Rejected(e) => e.kind(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::ResourceNotFound)
    }
}
