//! Authoritative host state: the replicated store plus the mutation log.
//!
//! Both live behind a single lock. The dispatcher holds it for the whole of
//! one invocation, which gives run-to-completion semantics: no two
//! invocations interleave, and every mutation committed by a call is
//! contiguous in the log. Work scheduled to finish later commits through
//! [`SharedState::commit`], which waits for the running invocation.

pub mod log;

use std::sync::Arc;

use hostlink_core::{Mutation, MutationId, Snapshot, StateStore, StoreBlueprint, StoreError};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::trace;

pub use log::{LogError, MutationLog};

use crate::service::events::StreamEmitter;

/// Store, log and mutation watchers.
///
/// Invariant: `store.last_applied() == log.tail()`.
#[derive(Debug)]
pub struct HostState {
    store: StateStore,
    log: MutationLog,
    watchers: Vec<StreamEmitter>,
}

impl HostState {
    #[must_use]
    pub fn new(blueprint: &StoreBlueprint) -> Self {
        Self {
            store: blueprint.build(),
            log: MutationLog::new(),
            watchers: Vec::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub fn log(&self) -> &MutationLog {
        &self.log
    }

    #[must_use]
    pub fn tail(&self) -> MutationId {
        self.log.tail()
    }

    /// Applies a mutation to the store and appends it to the log.
    ///
    /// # Errors
    ///
    /// Returns the store's error if no module accepts the mutation; nothing
    /// is appended in that case.
    pub fn commit(&mut self, mutation_type: &str, payload: Value) -> Result<Mutation, StoreError> {
        let candidate = Mutation::new(self.log.next_id(), mutation_type, payload);
        self.store.apply(&candidate)?;
        let committed = self.log.append(candidate.mutation_type, candidate.payload);
        trace!(id = %committed.id, mutation_type = %committed.mutation_type, "mutation committed");
        self.publish(&committed);
        Ok(committed)
    }

    /// State at the log tail.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Snapshot` if a module fails to serialize.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.store.snapshot()
    }

    /// Drops log entries at or below `upto`. The store is unaffected.
    pub fn compact(&mut self, upto: MutationId) -> usize {
        self.log.compact(upto)
    }

    /// Registers a stream that receives every mutation committed from now on.
    pub fn watch(&mut self, emitter: StreamEmitter) {
        self.watchers.push(emitter);
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    fn publish(&mut self, mutation: &Mutation) {
        if self.watchers.is_empty() {
            return;
        }
        self.watchers.retain(|w| {
            w.emit(mutation);
            w.is_active()
        });
    }
}

/// Cloneable handle to the host state.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<HostState>>,
}

impl SharedState {
    #[must_use]
    pub fn new(state: HostState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Exclusive access for the duration of the guard.
    pub fn lock(&self) -> MutexGuard<'_, HostState> {
        self.inner.lock()
    }

    /// Commits one mutation from outside an invocation.
    ///
    /// # Errors
    ///
    /// Returns the store's error if no module accepts the mutation.
    pub fn commit(&self, mutation_type: &str, payload: Value) -> Result<Mutation, StoreError> {
        self.inner.lock().commit(mutation_type, payload)
    }

    #[must_use]
    pub fn tail(&self) -> MutationId {
        self.inner.lock().tail()
    }

    /// Snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Snapshot` if a module fails to serialize.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.inner.lock().snapshot()
    }
}
