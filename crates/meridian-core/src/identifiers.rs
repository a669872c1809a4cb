//! Network element and cluster identifiers
//!
//! Identifiers are cheap, ordered value types. Ordering matters: the store and
//! the compiler iterate over `BTreeMap`s keyed by these types, which is what
//! makes their output deterministic across runs and replicas.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a cluster node (controller instance).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an infrastructure device, in `scheme:specific-part` form
/// (for example `of:0000000000000001`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier. Well-formedness is checked at the store
    /// boundary via [`DeviceId::is_well_formed`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI scheme of the identifier, if present
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once(':').map(|(scheme, _)| scheme)
    }

    /// True when the identifier has a non-empty scheme and specific part
    pub fn is_well_formed(&self) -> bool {
        match self.0.split_once(':') {
            Some((scheme, rest)) => {
                !scheme.is_empty()
                    && !rest.is_empty()
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
            }
            None => false,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Port number on a device.
///
/// The top of the `u64` range is reserved for logical ports that do not name
/// a physical interface (flood, controller, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PortNumber(u64);

impl PortNumber {
    /// Send back out of the ingress port
    pub const IN_PORT: PortNumber = PortNumber(0xffff_fff8);
    /// Submit to the first flow table
    pub const TABLE: PortNumber = PortNumber(0xffff_fff9);
    /// Forward using the device's non-OpenFlow pipeline
    pub const NORMAL: PortNumber = PortNumber(0xffff_fffa);
    /// Flood out of all ports except ingress
    pub const FLOOD: PortNumber = PortNumber(0xffff_fffb);
    /// All ports except ingress
    pub const ALL: PortNumber = PortNumber(0xffff_fffc);
    /// Send to the controller
    pub const CONTROLLER: PortNumber = PortNumber(0xffff_fffd);
    /// Local networking stack of the device
    pub const LOCAL: PortNumber = PortNumber(0xffff_fffe);
    /// Wildcard
    pub const ANY: PortNumber = PortNumber(0xffff_ffff);

    /// Create a port number
    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// True for reserved logical ports
    pub const fn is_logical(&self) -> bool {
        self.0 >= Self::IN_PORT.0 && self.0 <= Self::ANY.0
    }
}

impl From<u64> for PortNumber {
    fn from(number: u64) -> Self {
        Self(number)
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN_PORT => f.write_str("IN_PORT"),
            Self::TABLE => f.write_str("TABLE"),
            Self::NORMAL => f.write_str("NORMAL"),
            Self::FLOOD => f.write_str("FLOOD"),
            Self::ALL => f.write_str("ALL"),
            Self::CONTROLLER => f.write_str("CONTROLLER"),
            Self::LOCAL => f.write_str("LOCAL"),
            Self::ANY => f.write_str("ANY"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

/// A (device, port) attachment point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectPoint {
    /// Device the port belongs to
    pub device_id: DeviceId,
    /// Port on that device
    pub port: PortNumber,
}

impl ConnectPoint {
    /// Create a connection point
    pub fn new(device_id: DeviceId, port: impl Into<PortNumber>) -> Self {
        Self {
            device_id,
            port: port.into(),
        }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.port)
    }
}

/// Identity of a unidirectional link: its source and destination points.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    /// Transmitting end
    pub src: ConnectPoint,
    /// Receiving end
    pub dst: ConnectPoint,
}

impl LinkKey {
    /// Create a link key
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }

    /// True when either end sits on `device_id`
    pub fn touches(&self, device_id: &DeviceId) -> bool {
        &self.src.device_id == device_id || &self.dst.device_id == device_id
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Identifier of an end-station host, usually `MAC/VLAN`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(String);

impl HostId {
    /// Create a host identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a data-plane provider that submits descriptions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider identifier, e.g. `of` or `netconf`
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registered application, owner of intents and flow objectives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId {
    /// Short numeric id assigned at registration
    pub id: u16,
    /// Reverse-DNS application name
    pub name: String,
}

impl AppId {
    /// Create an application id
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_well_formed() {
        assert!(DeviceId::new("of:0000000000000001").is_well_formed());
        assert!(DeviceId::new("netconf:10.0.0.1:830").is_well_formed());
        assert!(!DeviceId::new("").is_well_formed());
        assert!(!DeviceId::new("of:").is_well_formed());
        assert!(!DeviceId::new(":123").is_well_formed());
        assert!(!DeviceId::new("no-scheme").is_well_formed());
        assert_eq!(DeviceId::new("of:1").scheme(), Some("of"));
    }

    #[test]
    fn test_logical_ports() {
        assert!(PortNumber::CONTROLLER.is_logical());
        assert!(PortNumber::ANY.is_logical());
        assert!(!PortNumber::new(1).is_logical());
        assert_eq!(PortNumber::FLOOD.to_string(), "FLOOD");
        assert_eq!(PortNumber::new(7).to_string(), "7");
    }

    #[test]
    fn test_link_key_touches() {
        let d1 = DeviceId::new("of:1");
        let d2 = DeviceId::new("of:2");
        let link = LinkKey::new(ConnectPoint::new(d1.clone(), 3), ConnectPoint::new(d2.clone(), 4));
        assert!(link.touches(&d1));
        assert!(link.touches(&d2));
        assert!(!link.touches(&DeviceId::new("of:3")));
        assert_eq!(link.to_string(), "of:1/3 -> of:2/4");
    }
}
