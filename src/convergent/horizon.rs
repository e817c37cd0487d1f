//! Causal context tracking via Horizons
//!
//! A Horizon records what operations a replica had seen when it performed
//! an action. This enables informed-remove semantics: removes only affect
//! state the remover knew about.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a replica (one per editing process or session).
pub type ReplicaId = String;

/// Sequence number within a replica's operation stream.
pub type SeqNum = u64;

/// Maps each known replica to the highest sequence number seen from it.
/// Comparing horizons tells whether one operation happened before another
/// or whether the two were concurrent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    seen: BTreeMap<ReplicaId, SeqNum>,
}

impl Horizon {
    /// An empty horizon: knows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number seen from a replica (0 if never seen).
    pub fn get(&self, replica: &ReplicaId) -> SeqNum {
        self.seen.get(replica).copied().unwrap_or(0)
    }

    /// Record having seen an operation from a replica.
    pub fn observe(&mut self, replica: &ReplicaId, seq: SeqNum) {
        let current = self.seen.entry(replica.clone()).or_insert(0);
        if seq > *current {
            *current = seq;
        }
    }

    /// Merge another horizon into this one (max of each replica).
    pub fn merge(&mut self, other: &Horizon) {
        for (replica, seq) in &other.seen {
            self.observe(replica, *seq);
        }
    }

    /// Whether this horizon has seen a specific operation.
    pub fn has_seen(&self, replica: &ReplicaId, seq: SeqNum) -> bool {
        self.get(replica) >= seq
    }

    /// Whether this horizon has seen everything the other has seen.
    pub fn dominates(&self, other: &Horizon) -> bool {
        other.seen.iter().all(|(r, s)| self.get(r) >= *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_goes_backwards() {
        let mut h = Horizon::new();
        assert_eq!(h.get(&"A".into()), 0);

        h.observe(&"A".into(), 5);
        h.observe(&"A".into(), 3);
        assert_eq!(h.get(&"A".into()), 5);

        h.observe(&"A".into(), 7);
        assert_eq!(h.get(&"A".into()), 7);
    }

    #[test]
    fn test_merge_takes_max() {
        let mut h1 = Horizon::new();
        h1.observe(&"A".into(), 5);
        h1.observe(&"B".into(), 1);

        let mut h2 = Horizon::new();
        h2.observe(&"A".into(), 2);
        h2.observe(&"B".into(), 4);

        h1.merge(&h2);
        assert_eq!(h1.get(&"A".into()), 5);
        assert_eq!(h1.get(&"B".into()), 4);
    }

    #[test]
    fn test_dominates() {
        let mut h1 = Horizon::new();
        h1.observe(&"A".into(), 5);
        h1.observe(&"B".into(), 3);

        let mut h2 = Horizon::new();
        h2.observe(&"A".into(), 3);

        assert!(h1.dominates(&h2));
        assert!(!h2.dominates(&h1));
    }
}
