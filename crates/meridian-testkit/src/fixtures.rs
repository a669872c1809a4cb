//! Topology and intent fixtures
//!
//! Linear topologies name devices `of:1 .. of:n`. Every device has ports
//! 1-4; port 3 of `of:i` is linked to port 4 of `of:i+1` in both directions.

use meridian_core::{
    AppId, ConnectPoint, DeviceId, LinkKey, LogicalTimestamp, NodeId, ProviderId, Timestamped,
    TrafficTreatment,
};
use meridian_intent::{Intent, LinkCollectionIntent};
use meridian_topology::{
    DeviceDescription, DeviceType, GenericPortType, LinkDescription, LinkType, PortDescription,
    TopologyStore,
};

/// Device `of:{n}`
pub fn device(n: u32) -> DeviceId {
    DeviceId::new(format!("of:{n}"))
}

/// Port `port` of device `of:{n}`
pub fn cp(n: u32, port: u64) -> ConnectPoint {
    ConnectPoint::new(device(n), port)
}

/// Timestamp issued by node `n1`
pub fn ts(logical: u64) -> LogicalTimestamp {
    LogicalTimestamp::new(logical, NodeId::new("n1"))
}

/// Application used by fixture intents
pub fn test_app() -> AppId {
    AppId::new(42, "org.meridian.test")
}

/// Store holding `n` switches in a line
pub fn linear_topology(n: u32) -> TopologyStore {
    let store = TopologyStore::default();
    let provider = ProviderId::new("of");
    for i in 1..=n {
        store
            .put_device_description(
                &provider,
                &device(i),
                Timestamped::new(DeviceDescription::new(device(i), DeviceType::Switch), ts(1)),
            )
            .unwrap();
        let ports = (1..=4u64)
            .map(|p| Timestamped::new(PortDescription::new(p, true, GenericPortType::Copper), ts(2)))
            .collect();
        store.update_ports(&provider, &device(i), ports).unwrap();
    }
    for i in 1..n {
        for (src, dst) in [(cp(i, 3), cp(i + 1, 4)), (cp(i + 1, 4), cp(i, 3))] {
            store
                .put_link_description(
                    &provider,
                    Timestamped::new(LinkDescription::new(src, dst, LinkType::Direct), ts(3)),
                )
                .unwrap();
        }
    }
    store
}

/// Forward links from `of:1` to `of:n`
pub fn linear_path(n: u32) -> Vec<LinkKey> {
    (1..n).map(|i| LinkKey::new(cp(i, 3), cp(i + 1, 4))).collect()
}

/// Intent `id` from `of:1` port 1 to `of:n` port 2 along the line, tagging
/// VLAN 100 at ingress
pub fn linear_intent(id: u64, n: u32) -> Intent {
    LinkCollectionIntent::builder(test_app(), id)
        .treatment(TrafficTreatment::builder().set_vlan_id(100).build())
        .ingress(cp(1, 1))
        .egress(cp(n, 2))
        .links(linear_path(n))
        .build()
        .unwrap()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_topology_shape() {
        let store = linear_topology(3);
        assert_eq!(store.devices().len(), 3);
        assert_eq!(store.links().len(), 4);
        assert_eq!(store.ports(&device(2)).len(), 4);
        assert_eq!(linear_intent(1, 3).devices().len(), 3);
    }
}
