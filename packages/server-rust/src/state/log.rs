//! Append-only mutation log with catch-up queries and bounded retention.
//!
//! Ids are assigned here and are strictly increasing with no gaps for the
//! lifetime of the host process. Compaction drops a prefix of the log; the
//! id of the last dropped entry is kept as `base` so catch-up requests from
//! before that point can be detected and answered with a snapshot instead.

use std::collections::VecDeque;

use hostlink_core::{Mutation, MutationId};

/// Errors returned by catch-up queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// Entries after `requested` have been compacted away.
    #[error("mutations after {requested} were compacted (log starts after {base})")]
    Compacted {
        requested: MutationId,
        base: MutationId,
    },
    /// The caller claims to have applied mutations this log never produced,
    /// which happens when a client outlives a host restart.
    #[error("cursor {requested} is ahead of the log tail {tail}")]
    AheadOfTail {
        requested: MutationId,
        tail: MutationId,
    },
}

/// Host-resident, append-only record of state changes.
#[derive(Debug, Default)]
pub struct MutationLog {
    entries: VecDeque<Mutation>,
    /// Id of the last compacted entry; every retained entry has a larger id.
    base: MutationId,
    tail: MutationId,
}

impl MutationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the newest entry (`MutationId::ZERO` when nothing was appended).
    #[must_use]
    pub fn tail(&self) -> MutationId {
        self.tail
    }

    /// Id of the newest compacted entry (`MutationId::ZERO` before any compaction).
    #[must_use]
    pub fn base(&self) -> MutationId {
        self.base
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id the next appended mutation will receive.
    #[must_use]
    pub fn next_id(&self) -> MutationId {
        self.tail.next()
    }

    /// Appends a mutation, assigning it the next id.
    pub fn append(&mut self, mutation_type: impl Into<String>, payload: serde_json::Value) -> Mutation {
        let mutation = Mutation::new(self.next_id(), mutation_type, payload);
        self.tail = mutation.id;
        self.entries.push_back(mutation.clone());
        mutation
    }

    /// Every retained mutation with an id above `after`, in id order.
    ///
    /// # Errors
    ///
    /// - `LogError::Compacted` if some of the requested entries were dropped.
    /// - `LogError::AheadOfTail` if `after` is beyond the tail.
    pub fn since(&self, after: MutationId) -> Result<Vec<Mutation>, LogError> {
        if after > self.tail {
            return Err(LogError::AheadOfTail {
                requested: after,
                tail: self.tail,
            });
        }
        if after < self.base {
            return Err(LogError::Compacted {
                requested: after,
                base: self.base,
            });
        }
        Ok(self.range(after, self.tail))
    }

    /// Retained mutations with `after < id <= upto`, in id order.
    #[must_use]
    pub fn range(&self, after: MutationId, upto: MutationId) -> Vec<Mutation> {
        let upto = upto.min(self.tail);
        let start = after.max(self.base);
        if start >= upto {
            return Vec::new();
        }
        let skip = index_offset(self.base, start);
        let take = index_offset(start, upto);
        self.entries.iter().skip(skip).take(take).cloned().collect()
    }

    /// Drops every entry with an id at or below `upto` (clamped to the tail).
    ///
    /// Returns the number of entries dropped.
    pub fn compact(&mut self, upto: MutationId) -> usize {
        let upto = upto.min(self.tail);
        if upto <= self.base {
            return 0;
        }
        let drop_count = index_offset(self.base, upto);
        self.entries.drain(..drop_count);
        self.base = upto;
        drop_count
    }
}

/// Distance between two ids as a collection index.
fn index_offset(from: MutationId, to: MutationId) -> usize {
    usize::try_from(to.0.saturating_sub(from.0)).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn log_with(n: u64) -> MutationLog {
        let mut log = MutationLog::new();
        for i in 0..n {
            log.append("Tick", json!(i));
        }
        log
    }

    #[test]
    fn empty_log_has_zero_tail() {
        let log = MutationLog::new();
        assert_eq!(log.tail(), MutationId::ZERO);
        assert!(log.is_empty());
        assert_eq!(log.since(MutationId::ZERO).unwrap(), vec![]);
    }

    #[test]
    fn append_assigns_consecutive_ids_from_one() {
        let mut log = MutationLog::new();
        let a = log.append("A", json!(null));
        let b = log.append("B", json!(null));
        assert_eq!(a.id, MutationId(1));
        assert_eq!(b.id, MutationId(2));
        assert_eq!(log.tail(), MutationId(2));
    }

    #[test]
    fn since_returns_suffix() {
        let log = log_with(5);
        let ids: Vec<u64> = log
            .since(MutationId(2))
            .unwrap()
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(log.since(MutationId(5)).unwrap().is_empty());
    }

    #[test]
    fn since_ahead_of_tail_is_an_error() {
        let log = log_with(2);
        assert_eq!(
            log.since(MutationId(9)),
            Err(LogError::AheadOfTail {
                requested: MutationId(9),
                tail: MutationId(2)
            })
        );
    }

    #[test]
    fn range_is_bounded_on_both_sides() {
        let log = log_with(6);
        let ids: Vec<u64> = log
            .range(MutationId(1), MutationId(4))
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(log.range(MutationId(4), MutationId(4)).is_empty());
        assert!(log.range(MutationId(5), MutationId(2)).is_empty());
    }

    #[test]
    fn compaction_drops_prefix_and_keeps_ids() {
        let mut log = log_with(10);
        assert_eq!(log.compact(MutationId(4)), 4);
        assert_eq!(log.base(), MutationId(4));
        assert_eq!(log.len(), 6);
        assert_eq!(log.tail(), MutationId(10));

        let ids: Vec<u64> = log
            .since(MutationId(4))
            .unwrap()
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, (5..=10).collect::<Vec<_>>());

        assert_eq!(
            log.since(MutationId(3)),
            Err(LogError::Compacted {
                requested: MutationId(3),
                base: MutationId(4)
            })
        );

        // New appends continue the sequence.
        assert_eq!(log.append("After", json!(null)).id, MutationId(11));
    }

    #[test]
    fn compaction_is_clamped_and_idempotent() {
        let mut log = log_with(3);
        assert_eq!(log.compact(MutationId(100)), 3);
        assert_eq!(log.base(), MutationId(3));
        assert!(log.is_empty());
        assert_eq!(log.compact(MutationId(2)), 0);
        assert!(log.since(MutationId(3)).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn ids_strictly_increase_without_gaps(
            ops in proptest::collection::vec((0u8..4, 0u64..20), 1..60)
        ) {
            let mut log = MutationLog::new();
            let mut seen: Vec<u64> = Vec::new();
            for (op, arg) in ops {
                if op == 0 {
                    log.compact(MutationId(arg));
                } else {
                    seen.push(log.append("Op", json!(arg)).id.0);
                }
            }
            let expected: Vec<u64> = (1..=seen.len() as u64).collect();
            prop_assert_eq!(seen, expected);

            let retained: Vec<u64> = log.range(log.base(), log.tail()).iter().map(|m| m.id.0).collect();
            let expected_retained: Vec<u64> = (log.base().0 + 1..=log.tail().0).collect();
            prop_assert_eq!(retained, expected_retained);
        }
    }
}
