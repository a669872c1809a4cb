//! Meridian Core - foundation types for the network control platform
//!
//! Everything the upper layers share lives here:
//!
//! - Identifiers for devices, ports, connect points, hosts and cluster nodes
//! - Logical time: `LogicalTimestamp`, `LogicalClock`, `Timestamped<T>` and the
//!   `TimestampProvider` used by last-writer-wins maps
//! - `Annotations` with sparse overlay merge and a removal marker
//! - The forwarding model: selectors, treatments and forwarding objectives
//! - The unified `MeridianError`, node configuration and the schema registry
//! - Capability traits for mastership and southbound installation
//!
//! This crate performs no I/O beyond reading a configuration file.

#![forbid(unsafe_code)]

/// Sparse key/value annotations
pub mod annotations;

/// Layered node configuration
pub mod config;

/// Capability traits for external collaborators
pub mod effects;

/// Unified error handling
pub mod errors;

/// Selectors, treatments and forwarding objectives
pub mod flow;

/// Network element and cluster identifiers
pub mod identifiers;

/// Schema registry and pooled codec
pub mod serialization;

/// Logical time
pub mod time;

pub use annotations::{Annotations, StampedAnnotations};
pub use config::{ConfigError, InstallConfig, MapConfig, MeridianConfig, NodeConfig, SerializationConfig};
pub use effects::{
    MastershipEvent, MastershipOracle, MastershipRole, ObjectiveError, ObjectiveInstaller,
};
pub use errors::{MeridianError, Result};
pub use flow::{
    Criterion, CriterionType, ForwardingObjective, Instruction, Ipv4Prefix, MacAddress,
    ObjectiveFlag, ObjectiveOp, TrafficSelector, TrafficSelectorBuilder, TrafficTreatment,
    TrafficTreatmentBuilder,
};
pub use identifiers::{AppId, ConnectPoint, DeviceId, HostId, LinkKey, NodeId, PortNumber, ProviderId};
pub use serialization::{Schema, SchemaRegistry, SchemaRegistryBuilder, SerializationError};
pub use time::{
    ClockTimestampProvider, LogicalClock, LogicalTimestamp, TimestampProvider, Timestamped,
};
