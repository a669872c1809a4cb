//! Sparse key/value annotations attached to network elements
//!
//! Annotations are an overlay: an update names only the keys it wants to set
//! (or remove), and keys it does not mention are preserved from earlier
//! updates. A key whose value equals [`Annotations::REMOVED`] deletes that key.

use crate::time::LogicalTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable-by-convention string map with sparse-overlay merge semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Annotations {
    entries: BTreeMap<String, String>,
}

impl Annotations {
    /// Marker value requesting removal of a key during merge
    pub const REMOVED: &'static str = "~rEmOvEd~";

    /// Empty annotations
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `key` set to `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Return a copy that requests removal of `key` when merged
    pub fn with_removed(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), Self::REMOVED.to_string());
        self
    }

    /// Value for `key`, ignoring removal markers
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| *v != Self::REMOVED)
    }

    /// True when this overlay requests removal of `key`
    pub fn is_removed(&self, key: &str) -> bool {
        self.entries.get(key).map(String::as_str) == Some(Self::REMOVED)
    }

    /// Keys present in this overlay, including removal requests
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate raw entries, including removal markers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of raw entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First key that is empty, if any. Used to reject malformed submissions.
    pub fn first_invalid_key(&self) -> Option<&str> {
        self.entries.keys().map(String::as_str).find(|k| k.trim().is_empty())
    }

    /// Overlay `newer` on `older`: keys in `newer` win, keys only in `older`
    /// survive, removal markers in `newer` delete the key.
    pub fn union(older: &Annotations, newer: &Annotations) -> Annotations {
        let mut entries = older.entries.clone();
        for (key, value) in &newer.entries {
            if value == Self::REMOVED {
                entries.remove(key);
            } else {
                entries.insert(key.clone(), value.clone());
            }
        }
        entries.retain(|_, v| v != Self::REMOVED);
        Annotations { entries }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Annotations {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Annotations with a timestamp per key.
///
/// Keeping the stamp of the update that last touched each key makes the
/// per-key newer-wins rule order-independent: three updates applied in any
/// order yield the same materialized map. Removed keys keep their stamp so an
/// older value cannot bring them back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedAnnotations {
    entries: BTreeMap<String, (Option<String>, LogicalTimestamp)>,
}

impl StampedAnnotations {
    /// Empty stamped annotations
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a single overlay applied at `timestamp`
    pub fn from_overlay(overlay: &Annotations, timestamp: &LogicalTimestamp) -> Self {
        let mut stamped = Self::new();
        stamped.absorb(overlay, timestamp);
        stamped
    }

    /// Apply `overlay` stamped at `timestamp`; a key is overwritten when
    /// `timestamp` is newer than the key's current stamp, or equal to it and
    /// the incoming value wins the tie.
    ///
    /// Returns true when any key changed.
    pub fn absorb(&mut self, overlay: &Annotations, timestamp: &LogicalTimestamp) -> bool {
        let mut changed = false;
        for (key, value) in overlay.iter() {
            let incoming = (value != Annotations::REMOVED).then(|| value.to_string());
            match self.entries.get_mut(key) {
                Some((current, stamp)) => {
                    if supersedes(&incoming, timestamp, current, stamp) {
                        if *current != incoming {
                            changed = true;
                        }
                        *current = incoming;
                        *stamp = timestamp.clone();
                    }
                }
                None => {
                    changed |= incoming.is_some();
                    self.entries
                        .insert(key.to_string(), (incoming, timestamp.clone()));
                }
            }
        }
        changed
    }

    /// Merge another stamped map key by key
    pub fn join(&mut self, other: &StampedAnnotations) -> bool {
        let mut changed = false;
        for (key, (value, stamp)) in &other.entries {
            match self.entries.get_mut(key) {
                Some((current, current_stamp))
                    if supersedes(value, stamp, current, current_stamp) =>
                {
                    changed |= current != value;
                    *current = value.clone();
                    *current_stamp = stamp.clone();
                }
                Some(_) => {}
                None => {
                    changed |= value.is_some();
                    self.entries
                        .insert(key.clone(), (value.clone(), stamp.clone()));
                }
            }
        }
        changed
    }

    /// Live key/value pairs as plain annotations
    pub fn materialize(&self) -> Annotations {
        self.entries
            .iter()
            .filter_map(|(k, (v, _))| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Stamp of the last update that touched `key`
    pub fn stamp(&self, key: &str) -> Option<&LogicalTimestamp> {
        self.entries.get(key).map(|(_, stamp)| stamp)
    }
}

/// Order of two values written at the same stamp: a removal beats a value,
/// and the larger of two values wins
fn tie_wins(incoming: &Option<String>, current: &Option<String>) -> bool {
    match (incoming, current) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

fn supersedes(
    incoming: &Option<String>,
    stamp: &LogicalTimestamp,
    current: &Option<String>,
    current_stamp: &LogicalTimestamp,
) -> bool {
    stamp > current_stamp || (stamp == current_stamp && tie_wins(incoming, current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::NodeId;

    fn ts(logical: u64) -> LogicalTimestamp {
        LogicalTimestamp::new(logical, NodeId::new("n1"))
    }

    #[test]
    fn test_union_overlays_newer_keys() {
        let old = Annotations::new().with("a", "1").with("b", "2");
        let new = Annotations::new().with("b", "3").with("c", "4");
        let merged = Annotations::union(&old, &new);
        let expected = Annotations::new().with("a", "1").with("b", "3").with("c", "4");
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_union_honours_removal_marker() {
        let old = Annotations::new().with("a", "1").with("b", "2");
        let new = Annotations::new().with_removed("a");
        let merged = Annotations::union(&old, &new);
        assert_eq!(merged.get("a"), None);
        assert!(!merged.is_removed("a"));
        assert_eq!(merged.get("b"), Some("2"));
    }

    #[test]
    fn test_stamped_out_of_order_converges() {
        let a = Annotations::new().with("k", "a").with("x", "1");
        let b = Annotations::new().with("k", "b");
        let c = Annotations::new().with("y", "3");

        let mut in_order = StampedAnnotations::new();
        in_order.absorb(&a, &ts(1));
        in_order.absorb(&b, &ts(2));
        in_order.absorb(&c, &ts(3));

        let mut shuffled = StampedAnnotations::new();
        shuffled.absorb(&a, &ts(1));
        shuffled.absorb(&c, &ts(3));
        shuffled.absorb(&b, &ts(2));

        assert_eq!(in_order.materialize(), shuffled.materialize());
        assert_eq!(shuffled.materialize().get("k"), Some("b"));
    }

    #[test]
    fn test_removed_key_not_resurrected_by_older_value() {
        let mut stamped = StampedAnnotations::new();
        stamped.absorb(&Annotations::new().with_removed("k"), &ts(5));
        let changed = stamped.absorb(&Annotations::new().with("k", "old"), &ts(2));
        assert!(!changed);
        assert_eq!(stamped.materialize().get("k"), None);
    }

    #[test]
    fn test_absorb_reports_no_change_for_duplicate() {
        let overlay = Annotations::new().with("a", "1");
        let mut stamped = StampedAnnotations::from_overlay(&overlay, &ts(1));
        assert!(!stamped.absorb(&overlay, &ts(1)));
    }

    #[test]
    fn test_equal_stamp_resolved_by_value() {
        let x = Annotations::new().with("k", "x");
        let y = Annotations::new().with("k", "y");

        let mut forward = StampedAnnotations::from_overlay(&x, &ts(3));
        assert!(forward.absorb(&y, &ts(3)));
        let mut backward = StampedAnnotations::from_overlay(&y, &ts(3));
        assert!(!backward.absorb(&x, &ts(3)));
        assert_eq!(forward, backward);
        assert_eq!(forward.materialize().get("k"), Some("y"));

        let mut joined = StampedAnnotations::from_overlay(&x, &ts(3));
        assert!(joined.join(&StampedAnnotations::from_overlay(&y, &ts(3))));
        assert_eq!(joined, forward);

        forward.absorb(&Annotations::new().with_removed("k"), &ts(3));
        assert_eq!(forward.materialize().get("k"), None);
    }
}
