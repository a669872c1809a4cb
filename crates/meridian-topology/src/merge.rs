//! Per-element merge of timestamped descriptions
//!
//! A [`MergedElement`] keeps enough history to make the merge independent of
//! arrival order:
//!
//! - the newest raw submission, which supplies every scalar field
//! - a stamp per annotation key, so each key follows newer-wins on its own
//! - the newest submission's typed fields that cannot be expressed as
//!   annotations (the optical port subtypes), with their own stamp
//!
//! The visible description is rebuilt from those three parts after every
//! absorb or join and cached.
//!
//! Two different submissions carrying the same stamp are ordered by their
//! encoded bytes, so every replica keeps the same one.

use crate::descriptions::ElementDescription;
use meridian_core::{LogicalTimestamp, StampedAnnotations, Timestamped};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Merged state of one element key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MergedElement<D: ElementDescription> {
    latest: Timestamped<D>,
    annotations: StampedAnnotations,
    retained: Option<Timestamped<D::Retained>>,
    merged: Timestamped<D>,
}

impl<D: ElementDescription> MergedElement<D> {
    /// State after a single submission
    pub fn new(incoming: Timestamped<D>) -> Self {
        let annotations =
            StampedAnnotations::from_overlay(incoming.value().annotations(), incoming.timestamp());
        let retained = incoming
            .value()
            .retained()
            .map(|r| Timestamped::new(r, incoming.timestamp().clone()));
        let merged = materialize(&incoming, &annotations, retained.as_ref());
        Self {
            latest: incoming,
            annotations,
            retained,
            merged,
        }
    }

    /// Merge one submission; true when the visible description changed
    pub fn absorb(&mut self, incoming: Timestamped<D>) -> bool {
        let timestamp = incoming.timestamp().clone();
        self.annotations
            .absorb(incoming.value().annotations(), &timestamp);
        if let Some(retained) = incoming.value().retained() {
            self.offer_retained(Timestamped::new(retained, timestamp.clone()));
        }
        if supersedes(&incoming, &self.latest) {
            self.latest = incoming;
        }
        self.refresh()
    }

    /// Merge the state another replica holds for the same key
    pub fn join(&mut self, other: &MergedElement<D>) -> bool {
        self.annotations.join(&other.annotations);
        if let Some(retained) = &other.retained {
            self.offer_retained(retained.clone());
        }
        if supersedes(&other.latest, &self.latest) {
            self.latest = other.latest.clone();
        }
        self.refresh()
    }

    /// Visible merged description
    pub fn description(&self) -> &D {
        self.merged.value()
    }

    /// Stamp of the newest submission
    pub fn timestamp(&self) -> &LogicalTimestamp {
        self.merged.timestamp()
    }

    /// Merged description with its stamp
    pub fn timestamped(&self) -> &Timestamped<D> {
        &self.merged
    }

    /// Newest raw submission, before annotations and typed fields are merged in
    pub fn latest_submission(&self) -> &Timestamped<D> {
        &self.latest
    }

    fn offer_retained(&mut self, candidate: Timestamped<D::Retained>) {
        let replace = match &self.retained {
            Some(current) => supersedes(&candidate, current),
            None => true,
        };
        if replace {
            self.retained = Some(candidate);
        }
    }

    fn refresh(&mut self) -> bool {
        let merged = materialize(&self.latest, &self.annotations, self.retained.as_ref());
        let changed = merged.value() != self.merged.value();
        self.merged = merged;
        changed
    }
}

/// Newer stamp wins; at an equal stamp the larger encoding wins
fn supersedes<T: Serialize>(candidate: &Timestamped<T>, current: &Timestamped<T>) -> bool {
    match candidate.timestamp().cmp(current.timestamp()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            bincode::serialize(candidate.value()).ok() > bincode::serialize(current.value()).ok()
        }
    }
}

fn materialize<D: ElementDescription>(
    latest: &Timestamped<D>,
    annotations: &StampedAnnotations,
    retained: Option<&Timestamped<D::Retained>>,
) -> Timestamped<D> {
    let mut description = latest.value().clone().with_annotations(annotations.materialize());
    if let Some(retained) = retained {
        description = description.with_retained(retained.value());
    }
    Timestamped::new(description, latest.timestamp().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptions::{
        ChannelSpacing, DeviceDescription, DeviceType, Frequency, GenericPortType, GridType, OchSignal,
        OduSignalType, PortDescription, PortKind, PortType,
    };
    use meridian_core::{Annotations, DeviceId, NodeId};

    fn ts(logical: u64) -> LogicalTimestamp {
        LogicalTimestamp::new(logical, NodeId::new("n1"))
    }

    fn device(pairs: &[(&str, &str)]) -> DeviceDescription {
        let mut description = DeviceDescription::new(DeviceId::new("of:1"), DeviceType::Switch);
        description.annotations = pairs.iter().copied().collect::<Annotations>();
        description
    }

    fn och_kind() -> PortKind {
        PortKind::Och {
            signal_type: OduSignalType::Odu2,
            is_tunable: false,
            lambda: OchSignal {
                grid: GridType::Dwdm,
                channel_spacing: ChannelSpacing::Ghz100,
                spacing_multiplier: 3,
                slot_granularity: 8,
            },
        }
    }

    #[test]
    fn test_annotation_overlay() {
        let mut element = MergedElement::new(Timestamped::new(device(&[("a", "1"), ("b", "2")]), ts(1)));
        assert!(element.absorb(Timestamped::new(device(&[("b", "3"), ("c", "4")]), ts(2))));

        let merged = &element.description().annotations;
        assert_eq!(merged.get("a"), Some("1"));
        assert_eq!(merged.get("b"), Some("3"));
        assert_eq!(merged.get("c"), Some("4"));
        assert_eq!(element.timestamp(), &ts(2));
    }

    #[test]
    fn test_repeat_is_not_a_change() {
        let submission = Timestamped::new(device(&[("a", "1")]), ts(4));
        let mut element = MergedElement::new(submission.clone());
        let before = element.clone();
        assert!(!element.absorb(submission));
        assert_eq!(element, before);
    }

    #[test]
    fn test_older_submission_fills_missing_keys_only() {
        let mut element = MergedElement::new(Timestamped::new(device(&[("b", "new")]), ts(5)));
        let mut older = device(&[("a", "1"), ("b", "old")]);
        older.manufacturer = "stale".into();
        assert!(element.absorb(Timestamped::new(older, ts(2))));

        let merged = element.description();
        assert_eq!(merged.annotations.get("a"), Some("1"));
        assert_eq!(merged.annotations.get("b"), Some("new"));
        assert!(merged.manufacturer.is_empty());
        assert_eq!(element.timestamp(), &ts(5));
    }

    #[test]
    fn test_generic_update_keeps_och_fields() {
        let och = PortDescription::with_kind(7u64, true, och_kind()).annotate("x", "1");
        let mut element = MergedElement::new(Timestamped::new(och, ts(1)));

        let generic = PortDescription::new(7u64, false, GenericPortType::Fiber).annotate("y", "2");
        assert!(element.absorb(Timestamped::new(generic, ts(2))));

        let merged = element.description();
        assert_eq!(merged.port_type(), PortType::Och);
        assert_eq!(merged.kind, och_kind());
        assert!(!merged.enabled);
        assert_eq!(merged.annotations.get("x"), Some("1"));
        assert_eq!(merged.annotations.get("y"), Some("2"));
    }

    #[test]
    fn test_newest_rich_kind_wins_in_any_order() {
        let oms = PortKind::Oms {
            min_frequency: ghz(191_000),
            max_frequency: ghz(196_000),
            grid: ghz(50),
        };
        let updates = vec![
            Timestamped::new(PortDescription::with_kind(1u64, true, och_kind()), ts(1)),
            Timestamped::new(PortDescription::with_kind(1u64, true, oms.clone()), ts(2)),
            Timestamped::new(PortDescription::new(1u64, true, GenericPortType::Fiber), ts(3)),
        ];

        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]] {
            let mut element = MergedElement::new(updates[order[0]].clone());
            element.absorb(updates[order[1]].clone());
            element.absorb(updates[order[2]].clone());
            assert_eq!(element.description().kind, oms);
        }
    }

    #[test]
    fn test_join_matches_sequential_absorb() {
        let a = Timestamped::new(device(&[("a", "1")]), ts(1));
        let b = Timestamped::new(device(&[("a", "2"), ("b", "1")]), ts(3));

        let mut sequential = MergedElement::new(a.clone());
        sequential.absorb(b.clone());

        let mut left = MergedElement::new(a);
        let right = MergedElement::new(b);
        assert!(left.join(&right));
        assert_eq!(left.timestamped(), sequential.timestamped());
        assert!(!left.join(&right));
    }

    #[test]
    fn test_equal_stamp_resolved_in_any_order() {
        let mut up = DeviceDescription::new(DeviceId::new("of:1"), DeviceType::Switch);
        up.sw_version = "1.0".into();
        let mut down = up.clone();
        down.sw_version = "2.0".into();
        let up = Timestamped::new(up, ts(4));
        let down = Timestamped::new(down, ts(4));

        let mut forward = MergedElement::new(up.clone());
        forward.absorb(down.clone());
        let mut backward = MergedElement::new(down.clone());
        backward.absorb(up.clone());
        assert_eq!(forward, backward);

        let mut joined = MergedElement::new(up);
        joined.join(&MergedElement::new(down));
        assert_eq!(joined, forward);
    }

    fn ghz(value: u64) -> Frequency {
        Frequency::from_ghz(value)
    }
}
