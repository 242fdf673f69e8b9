//! Response envelope, also used (id-less) to deliver events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorCode, ErrorPayload};
use super::event::Event;
use crate::mutation::{Mutation, MutationId};
use crate::store::Snapshot;

/// Host-to-client frame.
///
/// For call responses exactly one of `result`/`error` is present, except for
/// `noReturn` calls which carry neither. Event frames carry only `event`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorPayload>,
    /// Present only when the caller was behind the log tail.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutations: Option<Vec<Mutation>>,
    /// Log tail after the call.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutation_id: Option<MutationId>,
    /// State baseline, sent instead of `mutations` when the caller is behind
    /// the retained part of the log.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snapshot: Option<Snapshot>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event: Option<Event>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Response for a call that did not want a result.
    #[must_use]
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Failed response. `id` is `None` when the request id was unrecoverable.
    #[must_use]
    pub fn failure(id: Option<String>, error: ErrorPayload) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Failed response built from a code and message.
    #[must_use]
    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(id, ErrorPayload::new(code, message))
    }

    /// Id-less frame delivering an event.
    #[must_use]
    pub fn for_event(event: Event) -> Self {
        Self {
            event: Some(event),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        self.event.is_some()
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
