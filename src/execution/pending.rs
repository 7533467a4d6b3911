//! Priority-ordered multiset of tests waiting for a device.

use std::collections::BTreeMap;

use crate::strategy::Rank;
use crate::test::Test;

/// A test waiting in the backlog together with the rank it was queued with.
#[derive(Debug, Clone)]
pub struct Queued {
    pub rank: Rank,
    pub test: Test,
}

/// Pending tests ordered by rank, then by insertion.
///
/// The same test may be present more than once (flaky copies). Reinserted
/// entries go behind every entry of equal rank.
#[derive(Debug, Default)]
pub struct PendingTests {
    entries: BTreeMap<(Rank, u64), Test>,
    next_seq: u64,
}

impl PendingTests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, test: Test, rank: Rank) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((rank, seq), test);
    }

    /// Puts a previously popped entry back, keeping its rank.
    pub fn push_back(&mut self, queued: Queued) {
        self.push(queued.test, queued.rank);
    }

    /// Removes and returns the highest priority entry.
    pub fn pop(&mut self) -> Option<Queued> {
        self.entries
            .pop_first()
            .map(|((rank, _), test)| Queued { rank, test })
    }

    /// Removes one queued copy of `test`, the one that would run last.
    pub fn remove_one(&mut self, test: &Test) -> bool {
        let key = self
            .entries
            .iter()
            .rev()
            .find(|(_, queued)| *queued == test)
            .map(|(key, _)| *key);
        match key {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Number of queued copies of `test`.
    pub fn count(&self, test: &Test) -> usize {
        self.entries.values().filter(|t| *t == test).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in draw order.
    pub fn iter(&self) -> impl Iterator<Item = &Test> {
        self.entries.values()
    }
}
