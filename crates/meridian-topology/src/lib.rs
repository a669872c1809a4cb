//! Meridian Topology - multi-provider topology state store
//!
//! Providers describe devices, ports, links and hosts. Several providers (and
//! several cluster nodes) may describe the same element; the store merges
//! their timestamped descriptions deterministically:
//!
//! - scalar fields come from the newest submission
//! - annotations merge per key, newer wins, absent keys are preserved
//! - optical port subtypes survive a newer generic submission
//!
//! Consumers read the merged view through [`TopologyStore`] or a
//! [`TopologySnapshot`], and follow changes on typed event buses.

#![forbid(unsafe_code)]

/// Element descriptions
pub mod descriptions;

/// Per-device description container
pub mod device_descriptions;

/// Topology errors
pub mod errors;

/// Change events
pub mod events;

/// Per-element merge
pub mod merge;

/// Cluster replication of the store
pub mod replication;

/// Snapshots and the read view
pub mod snapshot;

/// The store
pub mod store;

pub use descriptions::{
    ChannelSpacing, CltSignalType, DeviceDescription, DeviceType, ElementDescription, Frequency,
    GenericPortType, GridType, HostDescription, LinkDescription, LinkType, OchSignal,
    OduSignalType, OtuSignalType, PortDescription, PortKind, PortType,
};
pub use device_descriptions::{DeviceDescriptions, DeviceDigest, PortChange};
pub use errors::{Result, TopologyError};
pub use events::{DeviceEvent, DeviceEventKind, HostEvent, LinkEvent};
pub use merge::MergedElement;
pub use replication::{topology_schemas, TopologyReplicator};
pub use snapshot::{DeviceSnapshot, TopologySnapshot, TopologyView};
pub use store::TopologyStore;
