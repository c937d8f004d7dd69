//! # Vector Clocks
//!
//! Causality tracking for registry updates. Each peer owns one counter in
//! the clock; a peer bumps its own counter on every local mutation, and
//! clocks merge by pairwise max when updates meet. Comparing two clocks
//! tells the registry whether one update causally dominates the other or
//! whether they were concurrent and need conflict resolution.
//!
//! All operations are pure: they return a new clock and never mutate the
//! receiver. Clocks are small (one entry per writing peer), so the copies
//! are cheap relative to the network hop that carried them here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoalError};

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Every counter in `self` is ≤ the other's, at least one strictly.
    Before,
    /// Every counter in `self` is ≥ the other's, at least one strictly.
    After,
    /// Identical counters.
    Equal,
    /// Each clock has at least one counter ahead of the other.
    Concurrent,
}

/// A mapping from peer id to a non-negative event counter.
///
/// Missing entries count as zero, so `{a:1}` and `{a:1, b:0}` compare
/// `Equal`. The map is a `BTreeMap` so serialization is canonical: two
/// equal clocks always encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// An empty clock: no events observed anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a single first event at `peer`.
    pub fn with_peer(peer: &str) -> Result<Self> {
        let mut clock = Self::new();
        if peer.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "vector clock peer id must be non-empty".into(),
            ));
        }
        clock.entries.insert(peer.to_string(), 1);
        Ok(clock)
    }

    /// The counter for `peer` (zero if never seen).
    pub fn get(&self, peer: &str) -> u64 {
        self.entries.get(peer).copied().unwrap_or(0)
    }

    /// Number of peers that have ever ticked this clock.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no peer has ticked this clock.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy with `peer`'s counter incremented by one.
    ///
    /// This is the only way counters advance, and only the owning peer
    /// should call it for its own id; that is what keeps each counter
    /// monotonic at its owner.
    pub fn increment(&self, peer: &str) -> Result<Self> {
        if peer.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "vector clock peer id must be non-empty".into(),
            ));
        }
        let mut next = self.clone();
        *next.entries.entry(peer.to_string()).or_insert(0) += 1;
        Ok(next)
    }

    /// Returns the pairwise maximum of both clocks over the union of keys.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (peer, &count) in &other.entries {
            let entry = merged.entries.entry(peer.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        merged
    }

    /// Compares two clocks under the usual partial order.
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for peer in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(peer);
            let b = other.get(peer);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True iff `self` causally precedes `other`.
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// True iff neither clock dominates the other.
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (peer, count)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{peer}:{count}")?;
        }
        write!(f, "}}")
    }
}
