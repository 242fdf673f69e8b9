//! Client-side mirror of host state.
//!
//! Mutations are applied strictly in id order. Anything that arrives ahead
//! of the cursor waits in a buffer until the gap is filled; anything at or
//! below the cursor is a duplicate and is ignored.

use std::collections::BTreeMap;

use hostlink_core::{Mutation, MutationId, Snapshot, StateStore, StoreBlueprint, StoreError};
use tracing::{debug, warn};

/// Replicated store plus the out-of-order buffer in front of it.
#[derive(Debug)]
pub struct LocalCache {
    store: StateStore,
    buffered: BTreeMap<MutationId, Mutation>,
    synced: bool,
}

impl LocalCache {
    #[must_use]
    pub fn new(blueprint: &StoreBlueprint) -> Self {
        Self {
            store: blueprint.build(),
            buffered: BTreeMap::new(),
            synced: false,
        }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Highest mutation applied; sent as the catch-up cursor.
    #[must_use]
    pub fn cursor(&self) -> MutationId {
        self.store.last_applied()
    }

    /// Whether the cache has caught up with the host at least once, which
    /// makes local-fallback reads trustworthy.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Feeds mutations in any order and applies every contiguous run.
    ///
    /// Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns the store's error if a mutation cannot be applied. The cache
    /// is marked unsynced and the buffer dropped; a later snapshot restores
    /// it.
    pub fn ingest(&mut self, mutations: impl IntoIterator<Item = Mutation>) -> Result<usize, StoreError> {
        let cursor = self.cursor();
        for mutation in mutations {
            if mutation.id > cursor {
                self.buffered.insert(mutation.id, mutation);
            }
        }
        self.drain()
    }

    fn drain(&mut self) -> Result<usize, StoreError> {
        let mut applied = 0;
        loop {
            let next = self.cursor().next();
            let Some(mutation) = self.buffered.remove(&next) else {
                break;
            };
            if let Err(e) = self.store.apply(&mutation) {
                warn!(mutation = %mutation.id, error = %e, "cached state diverged from host");
                self.buffered.clear();
                self.synced = false;
                return Err(e);
            }
            applied += 1;
        }
        // Everything at or below the cursor is stale.
        let cursor = self.cursor();
        self.buffered.retain(|id, _| *id > cursor);
        if !self.buffered.is_empty() {
            debug!(cursor = %cursor, waiting = self.buffered.len(), "mutations buffered behind a gap");
        }
        Ok(applied)
    }

    /// Replaces the cached state with a host baseline, unless the cache is
    /// already further along.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Snapshot` if the baseline does not fit the
    /// blueprint.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<bool, StoreError> {
        if self.synced && snapshot.mutation_id < self.cursor() {
            return Ok(false);
        }
        self.store.restore(snapshot)?;
        self.drain()?;
        self.synced = true;
        Ok(true)
    }

    /// Records the host's log tail carried by a response.
    pub fn observe_tail(&mut self, tail: MutationId) {
        if self.cursor() >= tail && !self.synced && self.buffered.is_empty() {
            self.synced = true;
        }
    }

    /// Forgets everything; the next response re-fetches the full history.
    pub fn reset(&mut self, blueprint: &StoreBlueprint) {
        *self = Self::new(blueprint);
    }
}
