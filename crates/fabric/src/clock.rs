//! Vector clocks for causal ordering across nodes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-node logical counters.
///
/// A `BTreeMap` keeps serialization (and therefore hashing) deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `node`, zero when absent.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Advance this node's counter by one and return the new value.
    pub fn tick(&mut self, node: &NodeId) -> u64 {
        let counter = self.entries.entry(node.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &value) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
    }

    /// Sum of all counters; used as the primary causal sort key.
    pub fn sum(&self) -> u64 {
        self.entries.values().sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|&v| v == 0)
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// `self` strictly precedes `other`.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Every component of `self` is ≥ the matching component of `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }

    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(n, v)| (NodeId::from(*n), *v)).collect()
    }

    #[test]
    fn tick_is_monotonic() {
        let mut c = VectorClock::new();
        let a = NodeId::from("a");
        assert_eq!(c.tick(&a), 1);
        assert_eq!(c.tick(&a), 2);
        assert_eq!(c.get(&a), 2);
        assert_eq!(c.get(&NodeId::from("b")), 0);
    }

    #[test]
    fn merge_takes_component_max() {
        let mut left = clock(&[("a", 3), ("b", 1)]);
        left.merge(&clock(&[("a", 1), ("b", 4), ("c", 2)]));
        assert_eq!(left, clock(&[("a", 3), ("b", 4), ("c", 2)]));
    }

    #[test]
    fn ordering_relations() {
        let earlier = clock(&[("a", 1)]);
        let later = clock(&[("a", 2), ("b", 1)]);
        let other = clock(&[("b", 3)]);

        assert!(earlier.happens_before(&later));
        assert!(later.dominates(&earlier));
        assert!(!later.happens_before(&earlier));
        assert!(earlier.concurrent_with(&other));
        assert_eq!(earlier.compare(&earlier.clone()), CausalOrder::Equal);
    }

    #[test]
    fn missing_entries_count_as_zero() {
        let a = clock(&[("a", 0)]);
        let b = VectorClock::new();
        assert_eq!(a.compare(&b), CausalOrder::Equal);
        assert!(a.is_empty());
    }
}
