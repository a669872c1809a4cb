//! All descriptions known for one device

use crate::descriptions::{DeviceDescription, PortDescription};
use crate::errors::{Result, TopologyError};
use crate::merge::MergedElement;
use meridian_core::{LogicalTimestamp, PortNumber, ProviderId, Timestamped};
use meridian_maps::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of merging one port submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    /// First submission for the port number
    Added,
    /// Merged description differs from the stored one
    Updated,
    /// Nothing visible changed
    Unchanged,
}

/// Per-fragment summary of a device replica used by anti-entropy.
///
/// Two replicas hold the same state for a device exactly when their digests
/// are equal; a fragment present or different on one side only marks what
/// that side has to offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDigest {
    /// Hash of the merged device element and its providers
    pub device: Fingerprint,
    /// Hash of each merged port element
    pub ports: BTreeMap<PortNumber, Fingerprint>,
}

impl DeviceDigest {
    /// True when `self` carries a fragment `other` lacks or holds differently
    pub fn offers_to(&self, other: &DeviceDigest) -> bool {
        self.device != other.device
            || self
                .ports
                .iter()
                .any(|(number, fp)| other.ports.get(number) != Some(fp))
    }
}

fn hash_of(value: &impl Serialize) -> Result<Fingerprint> {
    let bytes = bincode::serialize(value).map_err(|e| TopologyError::Replication(e.to_string()))?;
    Ok(blake3::hash(&bytes).into())
}

/// Merged device description plus one merged description per port.
///
/// This is also the unit a replica re-pushes to a peer during anti-entropy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptions {
    device: MergedElement<DeviceDescription>,
    ports: BTreeMap<PortNumber, MergedElement<PortDescription>>,
    providers: BTreeSet<ProviderId>,
}

impl DeviceDescriptions {
    /// Start from the first device submission
    pub fn new(provider: ProviderId, description: Timestamped<DeviceDescription>) -> Self {
        Self {
            device: MergedElement::new(description),
            ports: BTreeMap::new(),
            providers: BTreeSet::from([provider]),
        }
    }

    /// Merge a device submission; true when the merged description changed
    pub fn put_device_desc(
        &mut self,
        provider: ProviderId,
        description: Timestamped<DeviceDescription>,
    ) -> bool {
        self.providers.insert(provider);
        self.device.absorb(description)
    }

    /// Merge a port submission
    pub fn put_port_desc(&mut self, description: Timestamped<PortDescription>) -> PortChange {
        let number = description.value().number;
        match self.ports.get_mut(&number) {
            Some(port) => {
                if port.absorb(description) {
                    PortChange::Updated
                } else {
                    PortChange::Unchanged
                }
            }
            None => {
                self.ports.insert(number, MergedElement::new(description));
                PortChange::Added
            }
        }
    }

    /// Drop a port, returning its last merged description
    pub fn remove_port(&mut self, number: PortNumber) -> Option<PortDescription> {
        self.ports
            .remove(&number)
            .map(|port| port.description().clone())
    }

    /// Merged device description
    pub fn device_desc(&self) -> &Timestamped<DeviceDescription> {
        self.device.timestamped()
    }

    /// Merged description of one port
    pub fn port_desc(&self, number: PortNumber) -> Option<&Timestamped<PortDescription>> {
        self.ports.get(&number).map(MergedElement::timestamped)
    }

    /// Merged port descriptions in port order
    pub fn port_descs(&self) -> impl Iterator<Item = &Timestamped<PortDescription>> {
        self.ports.values().map(MergedElement::timestamped)
    }

    /// Known port numbers in order
    pub fn port_numbers(&self) -> impl Iterator<Item = PortNumber> + '_ {
        self.ports.keys().copied()
    }

    /// Providers that have described this device
    pub fn providers(&self) -> &BTreeSet<ProviderId> {
        &self.providers
    }

    /// Newest stamp over the device and all of its ports
    pub fn latest_timestamp(&self) -> LogicalTimestamp {
        self.ports
            .values()
            .map(MergedElement::timestamp)
            .fold(self.device.timestamp(), |latest, ts| latest.max(ts))
            .clone()
    }

    /// Merge another replica's view of the same device.
    ///
    /// Returns the device change flag and the per-port outcome for every port
    /// the other side carries.
    pub fn join(&mut self, other: &DeviceDescriptions) -> (bool, Vec<(PortNumber, PortChange)>) {
        self.providers.extend(other.providers.iter().cloned());
        let device_changed = self.device.join(&other.device);
        let ports = other
            .ports
            .iter()
            .map(|(number, theirs)| {
                let change = match self.ports.get_mut(number) {
                    Some(ours) => {
                        if ours.join(theirs) {
                            PortChange::Updated
                        } else {
                            PortChange::Unchanged
                        }
                    }
                    None => {
                        self.ports.insert(*number, theirs.clone());
                        PortChange::Added
                    }
                };
                (*number, change)
            })
            .collect();
        (device_changed, ports)
    }

    /// Anti-entropy summary of this replica
    pub fn digest(&self) -> Result<DeviceDigest> {
        let ports = self
            .ports
            .iter()
            .map(|(number, port)| Ok((*number, hash_of(port)?)))
            .collect::<Result<_>>()?;
        Ok(DeviceDigest {
            device: hash_of(&(&self.device, &self.providers))?,
            ports,
        })
    }
}
