//! Topology store
//!
//! Single owner of every merged description on a node. Providers submit new
//! timestamped descriptions; the store merges them per element key and
//! publishes an event for every visible change. A merge that changes nothing
//! publishes nothing.
//!
//! Events are published while the state lock is held, so each bus delivers
//! events in the order the replica actually changed.
//!
//! Removal is immediate and leaves no tombstone: a submission that arrives
//! after the element was removed recreates it, whatever its timestamp.

use crate::descriptions::{
    DeviceDescription, ElementDescription, HostDescription, LinkDescription, PortDescription,
};
use crate::device_descriptions::{DeviceDescriptions, DeviceDigest, PortChange};
use crate::errors::{Result, TopologyError};
use crate::events::{DeviceEvent, HostEvent, LinkEvent};
use crate::merge::MergedElement;
use crate::snapshot::{DeviceSnapshot, TopologySnapshot, TopologyView};
use meridian_core::{
    DeviceId, HostId, LinkKey, LogicalTimestamp, MapConfig, PortNumber, ProviderId, Timestamped,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct StoreState {
    devices: BTreeMap<DeviceId, DeviceDescriptions>,
    availability: BTreeMap<DeviceId, Timestamped<bool>>,
    links: BTreeMap<LinkKey, MergedElement<LinkDescription>>,
    hosts: BTreeMap<HostId, MergedElement<HostDescription>>,
}

impl StoreState {
    fn device(&self, device_id: &DeviceId) -> Option<&DeviceDescription> {
        self.devices
            .get(device_id)
            .map(|descs| descs.device_desc().value())
    }

    fn is_available(&self, device_id: &DeviceId) -> bool {
        self.availability
            .get(device_id)
            .is_some_and(|flag| *flag.value())
    }

    /// Record that a provider described the device at `timestamp`. Returns
    /// true when a previously offline device came back.
    fn mark_seen(&mut self, device_id: &DeviceId, timestamp: &LogicalTimestamp) -> bool {
        match self.availability.get(device_id) {
            Some(current) if current.timestamp() >= timestamp => false,
            current => {
                let came_back = current.is_some_and(|flag| !*flag.value());
                self.availability
                    .insert(device_id.clone(), Timestamped::new(true, timestamp.clone()));
                came_back
            }
        }
    }

    /// Events for a device whose descriptions were just created
    fn added_events(descs: &DeviceDescriptions) -> Vec<DeviceEvent> {
        let device_id = descs.device_desc().value().device_id.clone();
        std::iter::once(DeviceEvent::DeviceAdded(descs.device_desc().value().clone()))
            .chain(descs.port_descs().map(|port| DeviceEvent::PortAdded {
                device_id: device_id.clone(),
                port: port.value().clone(),
            }))
            .collect()
    }
}

fn port_event(device_id: &DeviceId, change: PortChange, port: &PortDescription) -> Option<DeviceEvent> {
    let device_id = device_id.clone();
    let port = port.clone();
    match change {
        PortChange::Added => Some(DeviceEvent::PortAdded { device_id, port }),
        PortChange::Updated => Some(DeviceEvent::PortUpdated { device_id, port }),
        PortChange::Unchanged => None,
    }
}

/// Merged topology of the local replica
#[derive(Debug)]
pub struct TopologyStore {
    state: RwLock<StoreState>,
    device_events: broadcast::Sender<DeviceEvent>,
    link_events: broadcast::Sender<LinkEvent>,
    host_events: broadcast::Sender<HostEvent>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::with_config(&MapConfig::default())
    }
}

impl TopologyStore {
    /// Empty store whose event buses buffer `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: RwLock::new(StoreState::default()),
            device_events: broadcast::channel(capacity).0,
            link_events: broadcast::channel(capacity).0,
            host_events: broadcast::channel(capacity).0,
        }
    }

    /// Empty store sized from the map settings
    pub fn with_config(config: &MapConfig) -> Self {
        Self::new(config.event_channel_capacity)
    }

    /// Device and port events
    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device_events.subscribe()
    }

    /// Link events
    pub fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }

    /// Host events
    pub fn subscribe_hosts(&self) -> broadcast::Receiver<HostEvent> {
        self.host_events.subscribe()
    }

    fn publish_devices(&self, events: &[DeviceEvent]) {
        for event in events {
            // No subscribers is not an error
            let _ = self.device_events.send(event.clone());
        }
    }

    fn publish_links(&self, events: &[LinkEvent]) {
        for event in events {
            let _ = self.link_events.send(event.clone());
        }
    }

    // ------------------------------------------------------------------
    // Devices and ports
    // ------------------------------------------------------------------

    /// Merge a device description submitted by `provider`.
    ///
    /// Returns the events published: `DeviceAdded` for a new device,
    /// `DeviceUpdated` when the merged description changed, and
    /// `DeviceAvailabilityChanged` when an offline device is described again.
    pub fn put_device_description(
        &self,
        provider: &ProviderId,
        device_id: &DeviceId,
        description: Timestamped<DeviceDescription>,
    ) -> Result<Vec<DeviceEvent>> {
        description.value().validate()?;
        if &description.value().device_id != device_id {
            return Err(TopologyError::invalid(
                device_id,
                format!("description is for {}", description.value().device_id),
            ));
        }

        let timestamp = description.timestamp().clone();
        let mut state = self.state.write();
        let mut events = Vec::new();
        match state.devices.get_mut(device_id) {
            Some(descs) => {
                if descs.put_device_desc(provider.clone(), description) {
                    events.push(DeviceEvent::DeviceUpdated(descs.device_desc().value().clone()));
                }
            }
            None => {
                let descs = DeviceDescriptions::new(provider.clone(), description);
                events.push(DeviceEvent::DeviceAdded(descs.device_desc().value().clone()));
                state.devices.insert(device_id.clone(), descs);
                tracing::info!(device = %device_id, provider = %provider, "device added");
            }
        }
        if state.mark_seen(device_id, &timestamp) {
            if let Some(device) = state.device(device_id) {
                events.push(DeviceEvent::DeviceAvailabilityChanged {
                    device: device.clone(),
                    available: true,
                });
            }
        }

        tracing::debug!(
            device = %device_id,
            provider = %provider,
            timestamp = %timestamp,
            changes = events.len(),
            "merged device description"
        );
        self.publish_devices(&events);
        Ok(events)
    }

    /// Merge one port description of a known device
    pub fn put_port_description(
        &self,
        provider: &ProviderId,
        device_id: &DeviceId,
        description: Timestamped<PortDescription>,
    ) -> Result<Option<DeviceEvent>> {
        description.value().validate()?;
        let mut state = self.state.write();
        let descs = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.clone()))?;

        let number = description.value().number;
        let change = descs.put_port_desc(description);
        let event = descs
            .port_desc(number)
            .and_then(|port| port_event(device_id, change, port.value()));
        tracing::debug!(device = %device_id, port = %number, provider = %provider, change = ?change, "merged port description");
        if let Some(event) = &event {
            self.publish_devices(std::slice::from_ref(event));
        }
        Ok(event)
    }

    /// Replace the full port list of a device.
    ///
    /// Every listed port is merged. A stored port missing from the list is
    /// removed when it was last described before the newest entry of the
    /// batch. A batch whose every entry is no newer than the newest stamp
    /// already held for the device is discarded as stale, including ports it
    /// lists that are not stored yet.
    pub fn update_ports(
        &self,
        provider: &ProviderId,
        device_id: &DeviceId,
        ports: Vec<Timestamped<PortDescription>>,
    ) -> Result<Vec<DeviceEvent>> {
        for port in &ports {
            port.value().validate()?;
        }
        let mut state = self.state.write();
        let descs = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.clone()))?;

        let latest = descs.latest_timestamp();
        if ports.iter().all(|port| port.timestamp() <= &latest) {
            tracing::warn!(device = %device_id, provider = %provider, latest = %latest, "discarding stale port re-sync");
            return Ok(Vec::new());
        }
        let batch_newest = ports.iter().map(|port| port.timestamp().clone()).max();
        let listed: BTreeSet<PortNumber> = ports.iter().map(|port| port.value().number).collect();

        let mut events = Vec::new();
        for port in ports {
            let number = port.value().number;
            let change = descs.put_port_desc(port);
            if let Some(event) = descs
                .port_desc(number)
                .and_then(|merged| port_event(device_id, change, merged.value()))
            {
                events.push(event);
            }
        }

        if let Some(batch_newest) = batch_newest {
            let absent: Vec<PortNumber> = descs
                .port_descs()
                .filter(|port| !listed.contains(&port.value().number))
                .filter(|port| port.timestamp() < &batch_newest)
                .map(|port| port.value().number)
                .collect();
            for number in absent {
                if let Some(port) = descs.remove_port(number) {
                    events.push(DeviceEvent::PortRemoved {
                        device_id: device_id.clone(),
                        port,
                    });
                }
            }
        }

        tracing::debug!(device = %device_id, provider = %provider, changes = events.len(), "applied port re-sync");
        self.publish_devices(&events);
        Ok(events)
    }

    /// Remove one port
    pub fn remove_port(&self, device_id: &DeviceId, number: PortNumber) -> Option<DeviceEvent> {
        let mut state = self.state.write();
        let port = state.devices.get_mut(device_id)?.remove_port(number)?;
        let event = DeviceEvent::PortRemoved {
            device_id: device_id.clone(),
            port,
        };
        self.publish_devices(std::slice::from_ref(&event));
        Some(event)
    }

    /// Remove a device, its ports and every link touching it
    pub fn remove_device(&self, device_id: &DeviceId) -> Option<DeviceEvent> {
        let mut state = self.state.write();
        let descs = state.devices.remove(device_id)?;
        state.availability.remove(device_id);

        let touching: Vec<LinkKey> = state
            .links
            .keys()
            .filter(|key| key.touches(device_id))
            .cloned()
            .collect();
        let link_events: Vec<LinkEvent> = touching
            .iter()
            .filter_map(|key| state.links.remove(key))
            .map(|link| LinkEvent::LinkRemoved(link.description().clone()))
            .collect();

        let event = DeviceEvent::DeviceRemoved(descs.device_desc().value().clone());
        tracing::info!(device = %device_id, links = link_events.len(), "device removed");
        self.publish_links(&link_events);
        self.publish_devices(std::slice::from_ref(&event));
        Some(event)
    }

    /// Last-writer-wins update of a device's availability
    pub fn set_device_availability(
        &self,
        device_id: &DeviceId,
        available: bool,
        timestamp: LogicalTimestamp,
    ) -> Result<Option<DeviceEvent>> {
        let mut state = self.state.write();
        let device = state
            .device(device_id)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownDevice(device_id.clone()))?;

        if let Some(current) = state.availability.get(device_id) {
            if current.timestamp() >= &timestamp {
                return Ok(None);
            }
        }
        let was = state.is_available(device_id);
        state
            .availability
            .insert(device_id.clone(), Timestamped::new(available, timestamp));
        if was == available {
            return Ok(None);
        }

        tracing::info!(device = %device_id, available, "device availability changed");
        let event = DeviceEvent::DeviceAvailabilityChanged { device, available };
        self.publish_devices(std::slice::from_ref(&event));
        Ok(Some(event))
    }

    /// Merge a full replica of one device received from a peer.
    ///
    /// Every fragment is joined with the local one, so a copy carrying only
    /// older state changes nothing and a repeated copy produces no events.
    pub fn apply_resync(&self, incoming: DeviceDescriptions) -> Vec<DeviceEvent> {
        let device_id = incoming.device_desc().value().device_id.clone();
        let mut state = self.state.write();

        let events = match state.devices.get_mut(&device_id) {
            Some(descs) => {
                let (device_changed, ports) = descs.join(&incoming);
                let mut events = Vec::new();
                if device_changed {
                    events.push(DeviceEvent::DeviceUpdated(descs.device_desc().value().clone()));
                }
                events.extend(ports.into_iter().filter_map(|(number, change)| {
                    descs
                        .port_desc(number)
                        .and_then(|port| port_event(&device_id, change, port.value()))
                }));
                events
            }
            None => {
                let events = StoreState::added_events(&incoming);
                state.devices.insert(device_id.clone(), incoming);
                events
            }
        };

        let device_timestamp = state
            .devices
            .get(&device_id)
            .map(|descs| descs.device_desc().timestamp().clone());
        if let Some(timestamp) = device_timestamp {
            state.mark_seen(&device_id, &timestamp);
        }
        tracing::debug!(device = %device_id, changes = events.len(), "applied re-push");
        self.publish_devices(&events);
        events
    }

    // ------------------------------------------------------------------
    // Links and hosts
    // ------------------------------------------------------------------

    /// Merge a link description
    pub fn put_link_description(
        &self,
        provider: &ProviderId,
        description: Timestamped<LinkDescription>,
    ) -> Result<Option<LinkEvent>> {
        description.value().validate()?;
        let key = description.value().key();
        let mut state = self.state.write();
        let event = match state.links.get_mut(&key) {
            Some(link) => link
                .absorb(description)
                .then(|| LinkEvent::LinkUpdated(link.description().clone())),
            None => {
                let link = MergedElement::new(description);
                let event = LinkEvent::LinkAdded(link.description().clone());
                state.links.insert(key.clone(), link);
                Some(event)
            }
        };
        tracing::debug!(link = %key, provider = %provider, changed = event.is_some(), "merged link description");
        if let Some(event) = &event {
            self.publish_links(std::slice::from_ref(event));
        }
        Ok(event)
    }

    /// Remove a link
    pub fn remove_link(&self, key: &LinkKey) -> Option<LinkEvent> {
        let mut state = self.state.write();
        let link = state.links.remove(key)?;
        let event = LinkEvent::LinkRemoved(link.description().clone());
        self.publish_links(std::slice::from_ref(&event));
        Some(event)
    }

    /// Merge a host description
    pub fn put_host_description(
        &self,
        provider: &ProviderId,
        description: Timestamped<HostDescription>,
    ) -> Result<Option<HostEvent>> {
        description.value().validate()?;
        let host_id = description.value().host_id.clone();
        let mut state = self.state.write();
        let event = match state.hosts.get_mut(&host_id) {
            Some(host) => host
                .absorb(description)
                .then(|| HostEvent::HostUpdated(host.description().clone())),
            None => {
                let host = MergedElement::new(description);
                let event = HostEvent::HostAdded(host.description().clone());
                state.hosts.insert(host_id.clone(), host);
                Some(event)
            }
        };
        tracing::debug!(host = %host_id, provider = %provider, changed = event.is_some(), "merged host description");
        if let Some(event) = &event {
            let _ = self.host_events.send(event.clone());
        }
        Ok(event)
    }

    /// Remove a host
    pub fn remove_host(&self, host_id: &HostId) -> Option<HostEvent> {
        let mut state = self.state.write();
        let host = state.hosts.remove(host_id)?;
        let event = HostEvent::HostRemoved(host.description().clone());
        let _ = self.host_events.send(event.clone());
        Some(event)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Merged device description
    pub fn device(&self, device_id: &DeviceId) -> Option<DeviceDescription> {
        self.state.read().device(device_id).cloned()
    }

    /// All merged device descriptions in id order
    pub fn devices(&self) -> Vec<DeviceDescription> {
        self.state
            .read()
            .devices
            .values()
            .map(|descs| descs.device_desc().value().clone())
            .collect()
    }

    /// Merged port descriptions of a device in port order
    pub fn ports(&self, device_id: &DeviceId) -> Vec<PortDescription> {
        self.state
            .read()
            .devices
            .get(device_id)
            .map(|descs| descs.port_descs().map(|p| p.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Merged description of one port
    pub fn port(&self, device_id: &DeviceId, number: PortNumber) -> Option<PortDescription> {
        self.state
            .read()
            .devices
            .get(device_id)?
            .port_desc(number)
            .map(|p| p.value().clone())
    }

    /// Merged link description
    pub fn link(&self, key: &LinkKey) -> Option<LinkDescription> {
        self.state
            .read()
            .links
            .get(key)
            .map(|link| link.description().clone())
    }

    /// All links in key order
    pub fn links(&self) -> Vec<LinkDescription> {
        self.state
            .read()
            .links
            .values()
            .map(|link| link.description().clone())
            .collect()
    }

    /// Links whose source is on `device_id`
    pub fn links_from(&self, device_id: &DeviceId) -> Vec<LinkDescription> {
        self.state
            .read()
            .links
            .iter()
            .filter(|(key, _)| &key.src.device_id == device_id)
            .map(|(_, link)| link.description().clone())
            .collect()
    }

    /// Links whose destination is on `device_id`
    pub fn links_to(&self, device_id: &DeviceId) -> Vec<LinkDescription> {
        self.state
            .read()
            .links
            .iter()
            .filter(|(key, _)| &key.dst.device_id == device_id)
            .map(|(_, link)| link.description().clone())
            .collect()
    }

    /// Merged host description
    pub fn host(&self, host_id: &HostId) -> Option<HostDescription> {
        self.state
            .read()
            .hosts
            .get(host_id)
            .map(|host| host.description().clone())
    }

    /// All hosts in id order
    pub fn hosts(&self) -> Vec<HostDescription> {
        self.state
            .read()
            .hosts
            .values()
            .map(|host| host.description().clone())
            .collect()
    }

    /// True when the device is known and online
    pub fn is_available(&self, device_id: &DeviceId) -> bool {
        self.state.read().is_available(device_id)
    }

    /// Copy of everything known about one device
    pub fn device_descriptions(&self, device_id: &DeviceId) -> Option<DeviceDescriptions> {
        self.state.read().devices.get(device_id).cloned()
    }

    /// Newest stamp over a device and its ports
    pub fn latest_timestamp(&self, device_id: &DeviceId) -> Option<LogicalTimestamp> {
        self.state
            .read()
            .devices
            .get(device_id)
            .map(DeviceDescriptions::latest_timestamp)
    }

    /// Anti-entropy digest of every known device
    pub fn advertisement(&self) -> Result<BTreeMap<DeviceId, DeviceDigest>> {
        self.state
            .read()
            .devices
            .iter()
            .map(|(id, descs)| Ok((id.clone(), descs.digest()?)))
            .collect()
    }

    /// Consistent copy of the whole replica
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.read();
        TopologySnapshot {
            devices: state
                .devices
                .iter()
                .map(|(id, descs)| {
                    let device = DeviceSnapshot {
                        description: descs.device_desc().value().clone(),
                        available: state.is_available(id),
                        ports: descs.port_descs().map(|p| p.value().clone()).collect(),
                    };
                    (id.clone(), device)
                })
                .collect(),
            links: state
                .links
                .values()
                .map(|link| link.description().clone())
                .collect(),
            hosts: state
                .hosts
                .values()
                .map(|host| host.description().clone())
                .collect(),
        }
    }
}

impl TopologyView for TopologyStore {
    fn contains_device(&self, device_id: &DeviceId) -> bool {
        self.state.read().devices.contains_key(device_id)
    }

    fn port_numbers(&self, device_id: &DeviceId) -> Vec<PortNumber> {
        self.state
            .read()
            .devices
            .get(device_id)
            .map(|descs| descs.port_numbers().collect())
            .unwrap_or_default()
    }

    fn contains_link(&self, key: &LinkKey) -> bool {
        self.state.read().links.contains_key(key)
    }
}
