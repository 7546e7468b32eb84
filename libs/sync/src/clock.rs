//! Vector clocks for cross-source causality.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Every component of `self` is <= the other, and at least one is <.
    Before,
    /// Every component of `self` is >= the other, and at least one is >.
    After,
    Equal,
    Concurrent,
}

/// Map from source id to the last sequence number seen from that source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str) -> u64 {
        self.0.get(source).copied().unwrap_or(0)
    }

    /// Advance this source's component by one and return the new value.
    pub fn increment(&mut self, source: &str) -> u64 {
        let entry = self.0.entry(source.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Raise this source's component to at least `seq`.
    pub fn observe(&mut self, source: &str, seq: u64) {
        let entry = self.0.entry(source.to_string()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (source, seq) in &other.0 {
            self.observe(source, *seq);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for source in self.0.keys().chain(other.0.keys()) {
            match self.get(source).cmp(&other.get(source)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (false, false) => CausalOrder::Equal,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
