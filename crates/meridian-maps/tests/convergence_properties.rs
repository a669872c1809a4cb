//! Convergence property tests for the eventually consistent map
//!
//! Replicas that receive the same set of (key, value, timestamp) updates in
//! any order must end with identical entry sets. Anti-entropy between two
//! replicas holding disjoint updates must make them identical.

use meridian_core::{LogicalClock, LogicalTimestamp, NodeId};
use meridian_maps::{EventuallyConsistentMap, InMemoryNetwork, MapEntry};
use proptest::prelude::*;

type Update = (u8, MapEntry<u16>);

fn update_strategy() -> impl Strategy<Value = Update> {
    (
        0u8..6,
        prop::option::weighted(0.8, 0u16..4),
        1u64..8,
        prop::sample::select(vec!["n1", "n2", "n3"]),
    )
        .prop_map(|(key, value, logical, node)| {
            let timestamp = LogicalTimestamp::new(logical, NodeId::new(node));
            (key, MapEntry { value, timestamp })
        })
}

fn replica() -> EventuallyConsistentMap<u8, u16> {
    EventuallyConsistentMap::builder("prop", LogicalClock::new(NodeId::new("local"))).build()
}

proptest! {
    #[test]
    fn delivery_order_does_not_matter(
        updates in prop::collection::vec(update_strategy(), 0..24),
        permutation in prop::collection::vec(any::<prop::sample::Index>(), 24),
    ) {
        let in_order = replica();
        for update in &updates {
            in_order.merge(vec![update.clone()]).unwrap();
        }

        // Apply the same updates in a permuted order, with duplicates
        let mut pool = updates.clone();
        let reordered = replica();
        for index in &permutation {
            if pool.is_empty() {
                break;
            }
            let update = pool.swap_remove(index.index(pool.len()));
            reordered.merge(vec![update.clone(), update]).unwrap();
        }
        reordered.merge(pool).unwrap();

        prop_assert_eq!(in_order.entry_set(), reordered.entry_set());
        for (key, _) in &updates {
            prop_assert_eq!(in_order.timestamp_of(key), reordered.timestamp_of(key));
        }
    }

    #[test]
    fn merge_is_idempotent(updates in prop::collection::vec(update_strategy(), 0..16)) {
        let map = replica();
        map.merge(updates.clone()).unwrap();
        let once = map.entry_set();
        prop_assert_eq!(map.merge(updates).unwrap(), 0);
        prop_assert_eq!(once, map.entry_set());
    }
}

#[tokio::test]
async fn test_anti_entropy_converges_disjoint_replicas() {
    let network = InMemoryNetwork::new();
    let nodes = ["n1", "n2", "n3"];
    let maps: Vec<EventuallyConsistentMap<u8, u16>> = nodes
        .iter()
        .map(|n| {
            let node = NodeId::new(*n);
            EventuallyConsistentMap::builder("ae", LogicalClock::new(node.clone()))
                .with_transport(network.join(node))
                .build()
        })
        .collect();

    // Each replica receives a different slice of the history directly
    let history: Vec<_> = (0u8..9)
        .map(|i| {
            let ts = LogicalTimestamp::new(u64::from(i % 4) + 1, NodeId::new(nodes[usize::from(i % 3)]));
            let entry = if i % 5 == 4 {
                MapEntry::tombstone(ts)
            } else {
                MapEntry::value(u16::from(i), ts)
            };
            (i % 4, entry)
        })
        .collect();
    for (i, update) in history.into_iter().enumerate() {
        maps[i % 3].merge(vec![update]).unwrap();
    }

    // Full mesh reconciliation: every ordered pair gets a round
    for _ in 0..2 {
        for map in &maps {
            for _ in 0..2 {
                map.anti_entropy_round().await.unwrap();
            }
        }
    }

    assert_eq!(maps[0].entry_set(), maps[1].entry_set());
    assert_eq!(maps[1].entry_set(), maps[2].entry_set());
    assert_eq!(maps[0].digest(), maps[2].digest());
}
