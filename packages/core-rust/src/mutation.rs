//! Mutation records: the ordered unit of host state change.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position in the global mutation sequence.
///
/// Ids start at 1. `MutationId::ZERO` means "nothing applied yet" and is the
/// cursor of a client that has never synchronized.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl MutationId {
    pub const ZERO: MutationId = MutationId(0);

    /// The id immediately after this one.
    #[must_use]
    pub fn next(self) -> MutationId {
        MutationId(self.0 + 1)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One atomic, immutable state change.
///
/// The sequence of all mutations in `id` order fully determines host state
/// starting from the initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: MutationId,
    #[serde(rename = "type")]
    pub mutation_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    #[must_use]
    pub fn new(id: MutationId, mutation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            mutation_type: mutation_type.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_shape_uses_type_key_and_bare_id() {
        let m = Mutation::new(
            MutationId(11),
            "SceneAdded",
            json!({"id": "scene_1", "name": "Scene A"}),
        );
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(
            v,
            json!({"id": 11, "type": "SceneAdded", "payload": {"id": "scene_1", "name": "Scene A"}})
        );
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let m: Mutation = serde_json::from_value(json!({"id": 3, "type": "Cleared"})).unwrap();
        assert_eq!(m.payload, Value::Null);
        assert_eq!(m.id, MutationId(3));
    }

    #[test]
    fn ids_order_numerically() {
        assert!(MutationId(2) < MutationId(10));
        assert_eq!(MutationId::ZERO.next(), MutationId(1));
    }
}
