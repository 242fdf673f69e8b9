//! Local-fallback reads: derived values computable from replicated state.
//!
//! A resource can declare that some read-only property is a pure function of
//! replicated state. The host answers reads of that property by calling the
//! function against its store; a client holding a synchronized cache calls the
//! very same function against its own store instead of round-tripping.

use std::collections::HashMap;

use serde_json::Value;

use crate::store::StateStore;

/// Reasons a local-fallback read can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// The constructor arguments no longer name a live entity.
    #[error("not found: {0}")]
    NotFound(String),
    /// The store does not contain the module the read depends on.
    #[error("state module {0:?} is not part of this store")]
    MissingModule(&'static str),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

/// A pure read over replicated state.
///
/// Receives the resource's constructor arguments (empty for singletons).
pub type FallbackFn = fn(&StateStore, &[Value]) -> Result<Value, FallbackError>;

/// Table of local-fallback reads keyed by `(service name, property)`.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    entries: HashMap<(String, String), FallbackFn>,
}

impl FallbackTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a local-fallback read.
    #[must_use]
    pub fn with(mut self, service: &str, property: &str, read: FallbackFn) -> Self {
        self.insert(service, property, read);
        self
    }

    pub fn insert(&mut self, service: &str, property: &str, read: FallbackFn) {
        self.entries
            .insert((service.to_string(), property.to_string()), read);
    }

    #[must_use]
    pub fn get(&self, service: &str, property: &str) -> Option<FallbackFn> {
        self.entries
            .get(&(service.to_string(), property.to_string()))
            .copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
