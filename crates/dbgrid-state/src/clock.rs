//! Vector clocks for ordering concurrent record updates.
//!
//! A clock maps a peer identity to the number of mutations that peer has
//! stamped onto a record. Absent entries count as zero, so `{}` and
//! `{a: 0}` compare `Equal`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Less,
    Greater,
    Equal,
    Concurrent,
}

impl ClockOrdering {
    /// The relation seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            ClockOrdering::Less => ClockOrdering::Greater,
            ClockOrdering::Greater => ClockOrdering::Less,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `peer`, zero when absent.
    pub fn get(&self, peer: &str) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// A copy with `peer`'s counter advanced by one.
    pub fn increment(&self, peer: &str) -> Self {
        let mut next = self.0.clone();
        *next.entry(peer.to_string()).or_insert(0) += 1;
        Self(next)
    }

    /// Component-wise maximum of both clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (peer, &count) in &other.0 {
            let slot = merged.entry(peer.clone()).or_insert(0);
            *slot = (*slot).max(count);
        }
        Self(merged)
    }

    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for peer in self.0.keys().chain(other.0.keys()) {
            match self.get(peer).cmp(&other.get(peer)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Less,
            (false, true) => ClockOrdering::Greater,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(peer, &count)| (peer.as_str(), count))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&count| count == 0)
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(peer, count)| (peer.into(), count)).collect())
    }
}
