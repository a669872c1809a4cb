//! Logical time for ordering updates without global synchronization
//!
//! `LogicalTimestamp` is a Lamport counter paired with the issuing node. The
//! derived ordering compares the counter first and falls back to the node id,
//! so the order is total and every replica breaks ties the same way.

use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Totally ordered logical timestamp.
///
/// Field order is significant: `Ord` is derived, comparing `logical` before
/// `node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    /// Lamport counter value
    pub logical: u64,
    /// Node that issued the timestamp; deterministic tiebreak
    pub node: NodeId,
}

impl LogicalTimestamp {
    /// Create a timestamp
    pub fn new(logical: u64, node: NodeId) -> Self {
        Self { logical, node }
    }

    /// True when `self` orders strictly after `other`
    pub fn is_newer_than(&self, other: &LogicalTimestamp) -> bool {
        self > other
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.logical, self.node)
    }
}

/// Per-node Lamport clock.
///
/// `tick` issues strictly increasing timestamps for this node; `observe`
/// pulls the counter forward past any timestamp received from a peer so that
/// subsequent local updates dominate what this node has already seen.
#[derive(Debug)]
pub struct LogicalClock {
    node: NodeId,
    counter: AtomicU64,
}

impl LogicalClock {
    /// Create a clock for `node` starting at zero
    pub fn new(node: NodeId) -> Self {
        Self::starting_at(node, 0)
    }

    /// Create a clock whose next tick is `start + 1`
    pub fn starting_at(node: NodeId, start: u64) -> Self {
        Self {
            node,
            counter: AtomicU64::new(start),
        }
    }

    /// Node this clock issues timestamps for
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Issue the next timestamp
    pub fn tick(&self) -> LogicalTimestamp {
        let logical = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        LogicalTimestamp::new(logical, self.node.clone())
    }

    /// Advance past a timestamp observed from elsewhere
    pub fn observe(&self, seen: &LogicalTimestamp) {
        self.counter.fetch_max(seen.logical, Ordering::SeqCst);
    }

    /// Current counter value without advancing
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// A value tagged with the logical time it was produced at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    value: T,
    timestamp: LogicalTimestamp,
}

impl<T> Timestamped<T> {
    /// Tag `value` with `timestamp`
    pub fn new(value: T, timestamp: LogicalTimestamp) -> Self {
        Self { value, timestamp }
    }

    /// The wrapped value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The timestamp
    pub fn timestamp(&self) -> &LogicalTimestamp {
        &self.timestamp
    }

    /// True when this value's timestamp orders strictly after `other`'s
    pub fn is_newer_than<U>(&self, other: &Timestamped<U>) -> bool {
        self.timestamp.is_newer_than(&other.timestamp)
    }

    /// Split into value and timestamp
    pub fn into_parts(self) -> (T, LogicalTimestamp) {
        (self.value, self.timestamp)
    }

    /// Transform the value, keeping the timestamp
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped {
            value: f(self.value),
            timestamp: self.timestamp,
        }
    }
}

/// Source of per-entry timestamps for last-writer-wins maps.
///
/// `value` is `None` when timestamping a removal.
pub trait TimestampProvider<K, V>: Send + Sync {
    /// Timestamp for writing `value` (or removing, when `None`) under `key`
    fn timestamp(&self, key: &K, value: Option<&V>) -> LogicalTimestamp;
}

impl<K, V, F> TimestampProvider<K, V> for F
where
    F: Fn(&K, Option<&V>) -> LogicalTimestamp + Send + Sync,
{
    fn timestamp(&self, key: &K, value: Option<&V>) -> LogicalTimestamp {
        self(key, value)
    }
}

impl<K, V> TimestampProvider<K, V> for LogicalClock {
    fn timestamp(&self, _key: &K, _value: Option<&V>) -> LogicalTimestamp {
        self.tick()
    }
}

/// Provider backed by a clock shared with other components of the node.
#[derive(Debug, Clone)]
pub struct ClockTimestampProvider {
    clock: std::sync::Arc<LogicalClock>,
}

impl ClockTimestampProvider {
    /// Wrap a shared clock
    pub fn new(clock: std::sync::Arc<LogicalClock>) -> Self {
        Self { clock }
    }

    /// The underlying clock
    pub fn clock(&self) -> &std::sync::Arc<LogicalClock> {
        &self.clock
    }
}

impl<K, V> TimestampProvider<K, V> for ClockTimestampProvider {
    fn timestamp(&self, _key: &K, _value: Option<&V>) -> LogicalTimestamp {
        self.clock.tick()
    }
}
