//! Provider-submitted descriptions of network elements
//!
//! Descriptions are immutable values. The store never edits one in place; a
//! merge builds a new description from the newest submission, the merged
//! annotations and, for ports, the most recent optical subtype.

use crate::errors::{Result, TopologyError};
use meridian_core::{Annotations, ConnectPoint, DeviceId, HostId, LinkKey, MacAddress, PortNumber};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::net::IpAddr;

/// Common behaviour of element descriptions held by the store.
pub trait ElementDescription: Clone + PartialEq + Debug + Serialize + DeserializeOwned {
    /// Typed fields that survive a newer, less specific submission
    type Retained: Clone + PartialEq + Debug + Serialize + DeserializeOwned;

    /// Sparse annotations carried by the submission
    fn annotations(&self) -> &Annotations;

    /// Copy with `annotations` replacing the current set
    fn with_annotations(self, annotations: Annotations) -> Self;

    /// Fields this submission contributes to [`ElementDescription::Retained`]
    fn retained(&self) -> Option<Self::Retained> {
        None
    }

    /// Copy carrying `retained` where this submission has nothing more specific
    fn with_retained(self, _retained: &Self::Retained) -> Self {
        self
    }

    /// Reject malformed submissions before they reach the store
    fn validate(&self) -> Result<()>;
}

fn check_annotations(element: &dyn std::fmt::Display, annotations: &Annotations) -> Result<()> {
    match annotations.first_invalid_key() {
        Some(_) => Err(TopologyError::invalid(element, "annotation key must not be empty")),
        None => Ok(()),
    }
}

fn check_device_id(element: &dyn std::fmt::Display, device_id: &DeviceId) -> Result<()> {
    if device_id.is_well_formed() {
        Ok(())
    } else {
        Err(TopologyError::invalid(
            element,
            format!("device id '{device_id}' is not of the form scheme:id"),
        ))
    }
}

/// Kind of infrastructure device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Packet switch
    Switch,
    /// IP router
    Router,
    /// Reconfigurable optical add/drop multiplexer
    Roadm,
    /// OTN switch
    Otn,
    /// ROADM with OTN capability
    RoadmOtn,
    /// Firewall appliance
    Firewall,
    /// Anything else
    Other,
}

/// Description of an infrastructure device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// Device identity
    pub device_id: DeviceId,
    /// Device kind
    pub device_type: DeviceType,
    /// Manufacturer name
    pub manufacturer: String,
    /// Hardware version
    pub hw_version: String,
    /// Software version
    pub sw_version: String,
    /// Serial number
    pub serial_number: String,
    /// Chassis identifier
    pub chassis_id: Option<String>,
    /// Sparse annotations
    pub annotations: Annotations,
}

impl DeviceDescription {
    /// Minimal description; remaining fields default to empty
    pub fn new(device_id: DeviceId, device_type: DeviceType) -> Self {
        Self {
            device_id,
            device_type,
            manufacturer: String::new(),
            hw_version: String::new(),
            sw_version: String::new(),
            serial_number: String::new(),
            chassis_id: None,
            annotations: Annotations::new(),
        }
    }

    /// Builder-style manufacturer, hardware and software versions
    pub fn with_versions(
        mut self,
        manufacturer: impl Into<String>,
        hw_version: impl Into<String>,
        sw_version: impl Into<String>,
    ) -> Self {
        self.manufacturer = manufacturer.into();
        self.hw_version = hw_version.into();
        self.sw_version = sw_version.into();
        self
    }

    /// Builder-style serial number
    pub fn with_serial(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }

    /// Builder-style annotation
    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations = self.annotations.with(key, value);
        self
    }
}

impl ElementDescription for DeviceDescription {
    type Retained = ();

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    fn validate(&self) -> Result<()> {
        check_device_id(&self.device_id, &self.device_id)?;
        check_annotations(&self.device_id, &self.annotations)
    }
}

/// ODU signal carried by an OCh port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OduSignalType {
    /// 1.25 Gbit/s
    Odu0,
    /// 2.5 Gbit/s
    Odu1,
    /// 10 Gbit/s
    Odu2,
    /// 10.4 Gbit/s
    Odu2e,
    /// 40 Gbit/s
    Odu3,
    /// 100 Gbit/s
    Odu4,
}

/// Client signal of an ODU client port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CltSignalType {
    /// 1 Gigabit Ethernet
    Clt1GbE,
    /// 10 Gigabit Ethernet
    Clt10GbE,
    /// 40 Gigabit Ethernet
    Clt40GbE,
    /// 100 Gigabit Ethernet
    Clt100GbE,
}

impl CltSignalType {
    /// Client bit rate in Mbit/s
    pub fn bit_rate_mbps(self) -> u64 {
        match self {
            Self::Clt1GbE => 1_000,
            Self::Clt10GbE => 10_000,
            Self::Clt40GbE => 40_000,
            Self::Clt100GbE => 100_000,
        }
    }
}

/// OTU signal of an OTU port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtuSignalType {
    /// 10.7 Gbit/s
    Otu2,
    /// 111.8 Gbit/s
    Otu4,
}

/// Wavelength grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GridType {
    /// Dense WDM fixed grid
    Dwdm,
    /// Coarse WDM
    Cwdm,
    /// Flexible grid
    Flex,
}

/// Spacing between adjacent channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelSpacing {
    /// 100 GHz
    Ghz100,
    /// 50 GHz
    Ghz50,
    /// 25 GHz
    Ghz25,
    /// 12.5 GHz
    Ghz12_5,
}

impl ChannelSpacing {
    /// Spacing as a frequency
    pub fn frequency(self) -> Frequency {
        match self {
            Self::Ghz100 => Frequency::from_mhz(100_000),
            Self::Ghz50 => Frequency::from_mhz(50_000),
            Self::Ghz25 => Frequency::from_mhz(25_000),
            Self::Ghz12_5 => Frequency::from_mhz(12_500),
        }
    }
}

/// Optical frequency with MHz resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frequency(u64);

impl Frequency {
    /// From MHz
    pub fn from_mhz(mhz: u64) -> Self {
        Self(mhz)
    }

    /// From GHz
    pub fn from_ghz(ghz: u64) -> Self {
        Self(ghz * 1_000)
    }

    /// Value in MHz
    pub fn as_mhz(self) -> u64 {
        self.0
    }
}

/// Center frequency of the fixed DWDM grid (193.1 THz)
pub const CENTER_FREQUENCY: Frequency = Frequency(193_100_000);

/// Wavelength of an OCh port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OchSignal {
    /// Grid
    pub grid: GridType,
    /// Channel spacing
    pub channel_spacing: ChannelSpacing,
    /// Signed offset from the grid center in units of `channel_spacing`
    pub spacing_multiplier: i32,
    /// Width in 12.5 GHz slots
    pub slot_granularity: u32,
}

impl OchSignal {
    /// Center frequency of the channel
    pub fn center_frequency(&self) -> Frequency {
        let offset = i64::from(self.spacing_multiplier)
            * self.channel_spacing.frequency().as_mhz() as i64;
        Frequency::from_mhz((CENTER_FREQUENCY.as_mhz() as i64 + offset).max(0) as u64)
    }
}

/// Generic port media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericPortType {
    /// Electrical
    Copper,
    /// Optical, no further detail
    Fiber,
    /// Packet-only logical port
    Packet,
    /// Virtual port
    Virtual,
}

/// Port type as seen by applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    /// Electrical
    Copper,
    /// Optical, no further detail
    Fiber,
    /// Packet-only logical port
    Packet,
    /// Virtual port
    Virtual,
    /// Optical multiplex section
    Oms,
    /// Optical channel
    Och,
    /// ODU client
    OduClt,
    /// Optical transport unit
    Otu,
}

/// Port subtype with its typed fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// No subtype-specific fields
    Generic(GenericPortType),
    /// Optical multiplex section
    Oms {
        /// Lowest carried frequency
        min_frequency: Frequency,
        /// Highest carried frequency
        max_frequency: Frequency,
        /// Channel grid
        grid: Frequency,
    },
    /// Optical channel
    Och {
        /// Carried ODU signal
        signal_type: OduSignalType,
        /// Whether the wavelength may be retuned
        is_tunable: bool,
        /// Current wavelength
        lambda: OchSignal,
    },
    /// ODU client
    OduClt {
        /// Client signal
        signal_type: CltSignalType,
    },
    /// Optical transport unit
    Otu {
        /// OTU signal
        signal_type: OtuSignalType,
    },
}

impl PortKind {
    /// True for subtypes whose fields cannot be expressed as annotations
    pub fn is_rich(&self) -> bool {
        !matches!(self, Self::Generic(_))
    }

    /// Externally visible port type
    pub fn port_type(&self) -> PortType {
        match self {
            Self::Generic(GenericPortType::Copper) => PortType::Copper,
            Self::Generic(GenericPortType::Fiber) => PortType::Fiber,
            Self::Generic(GenericPortType::Packet) => PortType::Packet,
            Self::Generic(GenericPortType::Virtual) => PortType::Virtual,
            Self::Oms { .. } => PortType::Oms,
            Self::Och { .. } => PortType::Och,
            Self::OduClt { .. } => PortType::OduClt,
            Self::Otu { .. } => PortType::Otu,
        }
    }

    /// Number of channels on an OMS port
    pub fn total_channels(&self) -> Option<u64> {
        match self {
            Self::Oms {
                min_frequency,
                max_frequency,
                grid,
            } if grid.as_mhz() > 0 => {
                Some(max_frequency.as_mhz().saturating_sub(min_frequency.as_mhz()) / grid.as_mhz())
            }
            _ => None,
        }
    }
}

/// Description of one device port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    /// Port number on the device
    pub number: PortNumber,
    /// Administrative and operational state
    pub enabled: bool,
    /// Reported speed in Mbit/s
    pub speed_mbps: u64,
    /// Subtype and its typed fields
    pub kind: PortKind,
    /// Sparse annotations
    pub annotations: Annotations,
}

impl PortDescription {
    /// Generic port
    pub fn new(number: impl Into<PortNumber>, enabled: bool, port_type: GenericPortType) -> Self {
        Self {
            number: number.into(),
            enabled,
            speed_mbps: 0,
            kind: PortKind::Generic(port_type),
            annotations: Annotations::new(),
        }
    }

    /// Port with a specific subtype
    pub fn with_kind(number: impl Into<PortNumber>, enabled: bool, kind: PortKind) -> Self {
        Self {
            number: number.into(),
            enabled,
            speed_mbps: 0,
            kind,
            annotations: Annotations::new(),
        }
    }

    /// Builder-style speed
    pub fn speed(mut self, speed_mbps: u64) -> Self {
        self.speed_mbps = speed_mbps;
        self
    }

    /// Builder-style annotation
    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations = self.annotations.with(key, value);
        self
    }

    /// Externally visible port type
    pub fn port_type(&self) -> PortType {
        self.kind.port_type()
    }

    /// Speed derived from the client signal where the subtype defines one
    pub fn effective_speed_mbps(&self) -> u64 {
        match &self.kind {
            PortKind::OduClt { signal_type } => signal_type.bit_rate_mbps(),
            _ => self.speed_mbps,
        }
    }
}

impl ElementDescription for PortDescription {
    type Retained = PortKind;

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    fn retained(&self) -> Option<PortKind> {
        self.kind.is_rich().then(|| self.kind.clone())
    }

    fn with_retained(mut self, retained: &PortKind) -> Self {
        if !self.kind.is_rich() {
            self.kind = retained.clone();
        }
        self
    }

    fn validate(&self) -> Result<()> {
        let element = format!("port {}", self.number);
        if self.number.is_logical() {
            return Err(TopologyError::invalid(&element, "logical port numbers cannot be described"));
        }
        if let PortKind::Oms {
            min_frequency,
            max_frequency,
            ..
        } = &self.kind
        {
            if min_frequency > max_frequency {
                return Err(TopologyError::invalid(
                    &element,
                    "OMS minimum frequency exceeds maximum",
                ));
            }
        }
        check_annotations(&element, &self.annotations)
    }
}

/// Link type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Direct physical connection
    Direct,
    /// Connection through unmanaged infrastructure
    Indirect,
    /// Edge link to a host
    Edge,
    /// Optical connection
    Optical,
    /// Tunnel
    Tunnel,
    /// Virtual link
    Virtual,
}

/// Description of a unidirectional link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescription {
    /// Source connect point
    pub src: ConnectPoint,
    /// Destination connect point
    pub dst: ConnectPoint,
    /// Link type
    pub link_type: LinkType,
    /// Sparse annotations
    pub annotations: Annotations,
}

impl LinkDescription {
    /// Link without annotations
    pub fn new(src: ConnectPoint, dst: ConnectPoint, link_type: LinkType) -> Self {
        Self {
            src,
            dst,
            link_type,
            annotations: Annotations::new(),
        }
    }

    /// Builder-style annotation
    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations = self.annotations.with(key, value);
        self
    }

    /// Store key
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.src.clone(), self.dst.clone())
    }
}

impl ElementDescription for LinkDescription {
    type Retained = ();

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    fn validate(&self) -> Result<()> {
        let key = self.key();
        check_device_id(&key, &self.src.device_id)?;
        check_device_id(&key, &self.dst.device_id)?;
        if self.src == self.dst {
            return Err(TopologyError::invalid(&key, "source and destination are identical"));
        }
        check_annotations(&key, &self.annotations)
    }
}

/// Description of an end-station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescription {
    /// Host identity
    pub host_id: HostId,
    /// MAC address
    pub mac: MacAddress,
    /// VLAN, if tagged
    pub vlan: Option<u16>,
    /// Attachment point
    pub location: ConnectPoint,
    /// Known addresses
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Sparse annotations
    pub annotations: Annotations,
}

impl HostDescription {
    /// Host without addresses or annotations
    pub fn new(host_id: HostId, mac: MacAddress, location: ConnectPoint) -> Self {
        Self {
            host_id,
            mac,
            vlan: None,
            location,
            ip_addresses: BTreeSet::new(),
            annotations: Annotations::new(),
        }
    }

    /// Builder-style address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.insert(ip);
        self
    }
}

impl ElementDescription for HostDescription {
    type Retained = ();

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.host_id.as_str().trim().is_empty() {
            return Err(TopologyError::invalid("host", "host id is required"));
        }
        check_device_id(&self.host_id, &self.location.device_id)?;
        if matches!(self.vlan, Some(v) if v > 4095) {
            return Err(TopologyError::invalid(&self.host_id, "VLAN id out of range"));
        }
        check_annotations(&self.host_id, &self.annotations)
    }
}
