//! Annotation merge property tests
//!
//! - Stamped absorption is order independent
//! - Plain union matches stamped absorption when overlays arrive in order
//! - Removal markers never leak into merged output

use meridian_core::{Annotations, LogicalTimestamp, NodeId, StampedAnnotations};
use proptest::prelude::*;

fn overlay_strategy() -> impl Strategy<Value = Annotations> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["a", "b", "c", "d"]),
            prop_oneof![
                3 => "[a-z]{1,3}".prop_map(|s| s),
                1 => Just(Annotations::REMOVED.to_string()),
            ],
        ),
        0..4,
    )
    .prop_map(|pairs| pairs.into_iter().collect())
}

proptest! {
    #[test]
    fn stamped_absorb_is_order_independent(
        overlays in prop::collection::vec(overlay_strategy(), 1..6),
        seed in any::<u64>(),
    ) {
        let stamped: Vec<_> = overlays
            .iter()
            .enumerate()
            .map(|(i, o)| (o.clone(), LogicalTimestamp::new(i as u64 + 1, NodeId::new("n1"))))
            .collect();

        let mut forward = StampedAnnotations::new();
        for (overlay, ts) in &stamped {
            forward.absorb(overlay, ts);
        }

        let mut shuffled = stamped.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        if seed % 2 == 0 {
            shuffled.reverse();
        }
        let mut other = StampedAnnotations::new();
        for (overlay, ts) in &shuffled {
            other.absorb(overlay, ts);
        }

        prop_assert_eq!(forward.materialize(), other.materialize());
    }

    #[test]
    fn in_order_union_matches_stamped(
        overlays in prop::collection::vec(overlay_strategy(), 1..6),
    ) {
        let mut plain = Annotations::new();
        let mut stamped = StampedAnnotations::new();
        for (i, overlay) in overlays.iter().enumerate() {
            plain = Annotations::union(&plain, overlay);
            stamped.absorb(overlay, &LogicalTimestamp::new(i as u64 + 1, NodeId::new("n1")));
        }
        prop_assert_eq!(plain.clone(), stamped.materialize());
        prop_assert!(plain.iter().all(|(_, v)| v != Annotations::REMOVED));
    }
}

#[test]
fn test_scenario_overlay_from_two_timestamps() {
    let older = Annotations::new().with("a", "1").with("b", "2");
    let newer = Annotations::new().with("b", "3").with("c", "4");

    let mut stamped = StampedAnnotations::new();
    stamped.absorb(&newer, &LogicalTimestamp::new(2, NodeId::new("n1")));
    stamped.absorb(&older, &LogicalTimestamp::new(1, NodeId::new("n1")));

    let merged = stamped.materialize();
    assert_eq!(merged.get("a"), Some("1"));
    assert_eq!(merged.get("b"), Some("3"));
    assert_eq!(merged.get("c"), Some("4"));
    assert_eq!(merged.len(), 3);
}
