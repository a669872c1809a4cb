//! Point-in-time copy of the merged topology and the read view the
//! compiler validates against

use crate::descriptions::{DeviceDescription, HostDescription, LinkDescription, PortDescription};
use crate::errors::{Result, TopologyError};
use meridian_core::{ConnectPoint, DeviceId, LinkKey, PortNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only topology queries used to validate compiled intents
pub trait TopologyView: Send + Sync {
    /// True when the device is known
    fn contains_device(&self, device_id: &DeviceId) -> bool;

    /// Ports the device reports, in order; empty for unknown devices
    fn port_numbers(&self, device_id: &DeviceId) -> Vec<PortNumber>;

    /// True when the link is known
    fn contains_link(&self, key: &LinkKey) -> bool;

    /// True when the device reports `point`'s port
    fn contains_port(&self, point: &ConnectPoint) -> bool {
        self.port_numbers(&point.device_id).contains(&point.port)
    }
}

/// One device with its ports and availability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Merged device description
    pub description: DeviceDescription,
    /// Availability flag
    pub available: bool,
    /// Merged port descriptions in port order
    pub ports: Vec<PortDescription>,
}

/// Consistent copy of the whole local replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Devices by id
    pub devices: BTreeMap<DeviceId, DeviceSnapshot>,
    /// Links in key order
    pub links: Vec<LinkDescription>,
    /// Hosts in id order
    pub hosts: Vec<HostDescription>,
}

impl TopologySnapshot {
    /// Number of devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TopologyError::Export(e.to_string()))
    }
}

impl TopologyView for TopologySnapshot {
    fn contains_device(&self, device_id: &DeviceId) -> bool {
        self.devices.contains_key(device_id)
    }

    fn port_numbers(&self, device_id: &DeviceId) -> Vec<PortNumber> {
        self.devices
            .get(device_id)
            .map(|device| device.ports.iter().map(|p| p.number).collect())
            .unwrap_or_default()
    }

    fn contains_link(&self, key: &LinkKey) -> bool {
        self.links.iter().any(|link| &link.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptions::{DeviceType, GenericPortType, LinkType};

    fn snapshot() -> TopologySnapshot {
        let d1 = DeviceId::new("of:1");
        let d2 = DeviceId::new("of:2");
        let mut devices = BTreeMap::new();
        for id in [&d1, &d2] {
            devices.insert(
                id.clone(),
                DeviceSnapshot {
                    description: DeviceDescription::new(id.clone(), DeviceType::Switch),
                    available: true,
                    ports: vec![PortDescription::new(1u64, true, GenericPortType::Copper)],
                },
            );
        }
        TopologySnapshot {
            devices,
            links: vec![LinkDescription::new(
                ConnectPoint::new(d1, 1u64),
                ConnectPoint::new(d2, 1u64),
                LinkType::Direct,
            )],
            hosts: Vec::new(),
        }
    }

    #[test]
    fn test_view_queries() {
        let snapshot = snapshot();
        let d1 = DeviceId::new("of:1");
        assert!(snapshot.contains_device(&d1));
        assert!(!snapshot.contains_device(&DeviceId::new("of:9")));
        assert!(snapshot.contains_port(&ConnectPoint::new(d1.clone(), 1u64)));
        assert!(!snapshot.contains_port(&ConnectPoint::new(d1, 2u64)));
        assert!(snapshot.contains_link(&snapshot.links[0].key()));
    }

    #[test]
    fn test_json_export() {
        let json = snapshot().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["devices"]["of:1"]["available"].as_bool().unwrap());
        assert_eq!(value["links"].as_array().unwrap().len(), 1);
    }
}
