//! Replicated state: the store that mutations are applied to.
//!
//! The host and every client build a [`StateStore`] from the same
//! [`StoreBlueprint`], so applying the same mutation sequence produces the
//! same state on both sides. Host-side services never write state directly;
//! they commit mutations, which are applied here and appended to the log.

use std::any::Any;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::mutation::{Mutation, MutationId};

/// Errors raised while applying mutations or restoring snapshots.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("no state module handles mutation type {0:?}")]
    UnknownMutationType(String),
    #[error("mutation {got} applied out of order (expected {expected})")]
    OutOfOrder { expected: MutationId, got: MutationId },
    #[error("mutation {mutation_type:?} rejected: {reason}")]
    Rejected {
        mutation_type: String,
        reason: String,
    },
    #[error("state module {module:?} could not be serialized: {reason}")]
    Snapshot { module: String, reason: String },
}

/// A named slice of replicated state.
///
/// Implementations must be deterministic: `apply` may only depend on the
/// current state, the mutation type and the payload.
pub trait StateModule: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique module name, used as the snapshot key.
    const NAME: &'static str;

    /// Whether this module owns the given mutation type.
    fn handles(mutation_type: &str) -> bool;

    /// Applies one mutation owned by this module.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` when the payload does not fit the
    /// mutation type.
    fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError>;
}

/// Decodes a mutation payload into a typed value.
///
/// # Errors
///
/// Returns `StoreError::Rejected` if the payload has the wrong shape.
pub fn decode_payload<T: DeserializeOwned>(
    mutation_type: &str,
    payload: &Value,
) -> Result<T, StoreError> {
    T::deserialize(payload).map_err(|e| StoreError::Rejected {
        mutation_type: mutation_type.to_string(),
        reason: e.to_string(),
    })
}

/// Object-safe view over a `StateModule`.
trait ErasedModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn handles(&self, mutation_type: &str) -> bool;
    fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError>;
    fn snapshot(&self) -> Result<Value, StoreError>;
    fn restore(&mut self, state: Option<Value>) -> Result<(), StoreError>;
    fn as_any(&self) -> &dyn Any;
}

struct ModuleCell<M>(M);

impl<M: StateModule> ErasedModule for ModuleCell<M> {
    fn name(&self) -> &'static str {
        M::NAME
    }

    fn handles(&self, mutation_type: &str) -> bool {
        M::handles(mutation_type)
    }

    fn apply(&mut self, mutation_type: &str, payload: &Value) -> Result<(), StoreError> {
        self.0.apply(mutation_type, payload)
    }

    fn snapshot(&self) -> Result<Value, StoreError> {
        serde_json::to_value(&self.0).map_err(|e| StoreError::Snapshot {
            module: M::NAME.to_string(),
            reason: e.to_string(),
        })
    }

    fn restore(&mut self, state: Option<Value>) -> Result<(), StoreError> {
        self.0 = match state {
            Some(value) => M::deserialize(value).map_err(|e| StoreError::Snapshot {
                module: M::NAME.to_string(),
                reason: e.to_string(),
            })?,
            None => M::default(),
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        &self.0
    }
}

type ModuleCtor = fn() -> Box<dyn ErasedModule>;

fn construct<M: StateModule>() -> Box<dyn ErasedModule> {
    Box::new(ModuleCell(M::default()))
}

/// The list of state modules a store is built from.
///
/// Host and clients must build their stores from equal blueprints.
#[derive(Clone, Default)]
pub struct StoreBlueprint {
    ctors: Vec<(&'static str, ModuleCtor)>,
}

impl StoreBlueprint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module. Adding the same module twice has no effect.
    #[must_use]
    pub fn with<M: StateModule>(mut self) -> Self {
        if !self.ctors.iter().any(|(name, _)| *name == M::NAME) {
            self.ctors.push((M::NAME, construct::<M>));
        }
        self
    }

    /// Names of the modules in registration order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        self.ctors.iter().map(|(name, _)| *name).collect()
    }

    /// Builds a store in its initial state.
    #[must_use]
    pub fn build(&self) -> StateStore {
        StateStore {
            modules: self.ctors.iter().map(|(_, ctor)| ctor()).collect(),
            last_applied: MutationId::ZERO,
        }
    }
}

/// Serialized state of every module at a given point in the mutation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub mutation_id: MutationId,
    pub modules: BTreeMap<String, Value>,
}

/// Replicated state built from a blueprint, plus the id of the last mutation
/// applied to it.
pub struct StateStore {
    modules: Vec<Box<dyn ErasedModule>>,
    last_applied: MutationId,
}

impl StateStore {
    /// Id of the last applied mutation (`MutationId::ZERO` for a fresh store).
    #[must_use]
    pub fn last_applied(&self) -> MutationId {
        self.last_applied
    }

    /// Applies a mutation in sequence.
    ///
    /// Returns `Ok(false)` without touching state if the mutation was already
    /// applied (its id is not above `last_applied`).
    ///
    /// # Errors
    ///
    /// - `StoreError::OutOfOrder` if the mutation would leave a gap.
    /// - `StoreError::UnknownMutationType` if no module owns the type.
    /// - `StoreError::Rejected` if the owning module refuses the payload.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<bool, StoreError> {
        if mutation.id <= self.last_applied {
            return Ok(false);
        }
        let expected = self.last_applied.next();
        if mutation.id != expected {
            return Err(StoreError::OutOfOrder {
                expected,
                got: mutation.id,
            });
        }

        let module = self
            .modules
            .iter_mut()
            .find(|m| m.handles(&mutation.mutation_type))
            .ok_or_else(|| StoreError::UnknownMutationType(mutation.mutation_type.clone()))?;
        module.apply(&mutation.mutation_type, &mutation.payload)?;
        self.last_applied = mutation.id;
        Ok(true)
    }

    /// Whether some module owns the given mutation type.
    #[must_use]
    pub fn handles(&self, mutation_type: &str) -> bool {
        self.modules.iter().any(|m| m.handles(mutation_type))
    }

    /// Typed read access to a module.
    #[must_use]
    pub fn module<M: StateModule>(&self) -> Option<&M> {
        self.modules
            .iter()
            .find_map(|m| m.as_any().downcast_ref::<M>())
    }

    /// Serializes every module.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Snapshot` if a module fails to serialize.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut modules = BTreeMap::new();
        for module in &self.modules {
            modules.insert(module.name().to_string(), module.snapshot()?);
        }
        Ok(Snapshot {
            mutation_id: self.last_applied,
            modules,
        })
    }

    /// Replaces the whole state with a snapshot.
    ///
    /// Modules absent from the snapshot reset to their initial state; entries
    /// for modules this store does not know are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Snapshot` if a module cannot be deserialized. The
    /// store is left unchanged in that case.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        for name in snapshot.modules.keys() {
            if !self.modules.iter().any(|m| m.name() == name) {
                warn!(module = %name, "snapshot contains unknown state module, ignoring");
            }
        }

        let previous = self.snapshot()?;
        for module in &mut self.modules {
            let state = snapshot.modules.get(module.name()).cloned();
            if let Err(e) = module.restore(state) {
                for m in &mut self.modules {
                    // Re-applying our own serialized state cannot fail.
                    let _ = m.restore(previous.modules.get(m.name()).cloned());
                }
                return Err(e);
            }
        }
        self.last_applied = snapshot.mutation_id;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field(
                "modules",
                &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("last_applied", &self.last_applied)
            .finish()
    }
}
