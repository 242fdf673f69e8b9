//! Asynchronous results: subscription handles and the events addressed to them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceId;

const SUBSCRIPTION_TAG: &str = "SUBSCRIPTION";

/// Kind of asynchronous result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitterKind {
    /// Exactly one event, resolved or rejected.
    Deferred,
    /// Zero or more events until unsubscribed.
    Stream,
}

impl EmitterKind {
    /// Service name used for handles of this kind.
    #[must_use]
    pub fn handle_name(self) -> &'static str {
        match self {
            EmitterKind::Deferred => "AsyncOp",
            EmitterKind::Stream => "Subscription",
        }
    }
}

/// One asynchronous completion addressed to a subscription handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub resource_id: ResourceId,
    pub emitter: EmitterKind,
    #[serde(default)]
    pub data: Value,
    /// Only meaningful for `Deferred`: the one-shot result is a failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_rejected: Option<bool>,
}

impl Event {
    #[must_use]
    pub fn rejected(&self) -> bool {
        self.is_rejected.unwrap_or(false)
    }
}

/// Handle returned as the `result` of a call whose value is asynchronous.
///
/// Wire shape: `{ "_type": "SUBSCRIPTION", "resourceId": ..., "emitter": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub resource_id: ResourceId,
    pub emitter: EmitterKind,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandleWire {
    #[serde(rename = "_type")]
    tag: String,
    resource_id: ResourceId,
    emitter: EmitterKind,
}

impl SubscriptionHandle {
    /// The `sequence`-th handle of a kind: `AsyncOp(n)` or `Subscription(n)`.
    #[must_use]
    pub fn numbered(emitter: EmitterKind, sequence: u64) -> Self {
        Self {
            resource_id: ResourceId::instance_unchecked(
                emitter.handle_name(),
                vec![Value::from(sequence)],
            ),
            emitter,
        }
    }

    /// Encodes the handle as a call result.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let wire = HandleWire {
            tag: SUBSCRIPTION_TAG.to_string(),
            resource_id: self.resource_id.clone(),
            emitter: self.emitter,
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Recognizes a call result that is a subscription handle.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<SubscriptionHandle> {
        if value.get("_type").and_then(Value::as_str) != Some(SUBSCRIPTION_TAG) {
            return None;
        }
        let wire = HandleWire::deserialize(value).ok()?;
        Some(SubscriptionHandle {
            resource_id: wire.resource_id,
            emitter: wire.emitter,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn handle_wire_shape() {
        let handle = SubscriptionHandle {
            resource_id: ResourceId::parse("AsyncOp(7)").unwrap(),
            emitter: EmitterKind::Deferred,
        };
        let v = handle.to_value();
        assert_eq!(
            v,
            json!({"_type": "SUBSCRIPTION", "resourceId": "AsyncOp(7)", "emitter": "deferred"})
        );
        assert_eq!(SubscriptionHandle::from_value(&v), Some(handle));
    }

    #[test]
    fn numbered_handles_parse_back() {
        let handle = SubscriptionHandle::numbered(EmitterKind::Stream, 12);
        assert_eq!(handle.resource_id.as_str(), "Subscription(12)");
        assert_eq!(
            ResourceId::parse("Subscription(12)").unwrap(),
            handle.resource_id
        );
    }

    #[test]
    fn ordinary_results_are_not_handles() {
        assert!(SubscriptionHandle::from_value(&json!("scene_1")).is_none());
        assert!(SubscriptionHandle::from_value(&json!({"resourceId": "X"})).is_none());
        assert!(SubscriptionHandle::from_value(
            &json!({"_type": "SUBSCRIPTION", "resourceId": "bad id", "emitter": "stream"})
        )
        .is_none());
    }

    #[test]
    fn event_omits_is_rejected_when_unset() {
        let e = Event {
            resource_id: ResourceId::parse("Subscription(3)").unwrap(),
            emitter: EmitterKind::Stream,
            data: json!({"level": 0.5}),
            is_rejected: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(
            v,
            json!({"resourceId": "Subscription(3)", "emitter": "stream", "data": {"level": 0.5}})
        );
        assert!(!e.rejected());
    }
}
