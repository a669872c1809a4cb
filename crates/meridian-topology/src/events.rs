//! Change events published by the topology store
//!
//! Each category has its own broadcast bus. Events carry the merged
//! description after the change (or the last one, for removals).

use crate::descriptions::{DeviceDescription, HostDescription, LinkDescription, PortDescription};
use meridian_core::{DeviceId, HostId, LinkKey};
use serde::{Deserialize, Serialize};

/// Device and port event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceEventKind {
    /// Device first described
    DeviceAdded,
    /// Merged device description changed
    DeviceUpdated,
    /// Device administratively removed
    DeviceRemoved,
    /// Device went on or offline
    DeviceAvailabilityChanged,
    /// Port first described
    PortAdded,
    /// Merged port description changed
    PortUpdated,
    /// Port removed
    PortRemoved,
}

/// Change to a device or one of its ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Device first described
    DeviceAdded(DeviceDescription),
    /// Merged device description changed
    DeviceUpdated(DeviceDescription),
    /// Device administratively removed
    DeviceRemoved(DeviceDescription),
    /// Device went on or offline
    DeviceAvailabilityChanged {
        /// Merged device description
        device: DeviceDescription,
        /// New availability
        available: bool,
    },
    /// Port first described
    PortAdded {
        /// Owning device
        device_id: DeviceId,
        /// Merged port description
        port: PortDescription,
    },
    /// Merged port description changed
    PortUpdated {
        /// Owning device
        device_id: DeviceId,
        /// Merged port description
        port: PortDescription,
    },
    /// Port removed
    PortRemoved {
        /// Owning device
        device_id: DeviceId,
        /// Last merged port description
        port: PortDescription,
    },
}

impl DeviceEvent {
    /// Event kind
    pub fn kind(&self) -> DeviceEventKind {
        match self {
            Self::DeviceAdded(_) => DeviceEventKind::DeviceAdded,
            Self::DeviceUpdated(_) => DeviceEventKind::DeviceUpdated,
            Self::DeviceRemoved(_) => DeviceEventKind::DeviceRemoved,
            Self::DeviceAvailabilityChanged { .. } => DeviceEventKind::DeviceAvailabilityChanged,
            Self::PortAdded { .. } => DeviceEventKind::PortAdded,
            Self::PortUpdated { .. } => DeviceEventKind::PortUpdated,
            Self::PortRemoved { .. } => DeviceEventKind::PortRemoved,
        }
    }

    /// Device the event concerns
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::DeviceAdded(device)
            | Self::DeviceUpdated(device)
            | Self::DeviceRemoved(device)
            | Self::DeviceAvailabilityChanged { device, .. } => &device.device_id,
            Self::PortAdded { device_id, .. }
            | Self::PortUpdated { device_id, .. }
            | Self::PortRemoved { device_id, .. } => device_id,
        }
    }
}

/// Change to a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Link first described
    LinkAdded(LinkDescription),
    /// Merged link description changed
    LinkUpdated(LinkDescription),
    /// Link removed
    LinkRemoved(LinkDescription),
}

impl LinkEvent {
    /// Merged link description carried by the event
    pub fn link(&self) -> &LinkDescription {
        match self {
            Self::LinkAdded(link) | Self::LinkUpdated(link) | Self::LinkRemoved(link) => link,
        }
    }

    /// Key of the link
    pub fn key(&self) -> LinkKey {
        self.link().key()
    }
}

/// Change to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEvent {
    /// Host first described
    HostAdded(HostDescription),
    /// Merged host description changed
    HostUpdated(HostDescription),
    /// Host removed
    HostRemoved(HostDescription),
}

impl HostEvent {
    /// Merged host description carried by the event
    pub fn host(&self) -> &HostDescription {
        match self {
            Self::HostAdded(host) | Self::HostUpdated(host) | Self::HostRemoved(host) => host,
        }
    }

    /// Identity of the host
    pub fn host_id(&self) -> &HostId {
        &self.host().host_id
    }
}
