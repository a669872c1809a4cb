//! Flow model: traffic selectors, treatments and forwarding objectives
//!
//! A forwarding objective is the device-local unit the compiler produces and
//! the installer hands to the southbound driver.

use crate::identifiers::{AppId, PortNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// IPv4 prefix (address + mask length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ipv4Prefix {
    /// Network address
    pub address: Ipv4Addr,
    /// Prefix length, 0..=32
    pub len: u8,
}

impl Ipv4Prefix {
    /// Create a prefix
    pub fn new(address: Ipv4Addr, len: u8) -> Self {
        Self {
            address,
            len: len.min(32),
        }
    }
}

/// Kind of a match field; a selector holds at most one criterion per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CriterionType {
    /// Ingress port
    InPort,
    /// Ethernet type
    EthType,
    /// Ethernet source
    EthSrc,
    /// Ethernet destination
    EthDst,
    /// VLAN id
    VlanId,
    /// IP protocol number
    IpProto,
    /// IPv4 source prefix
    Ipv4Src,
    /// IPv4 destination prefix
    Ipv4Dst,
    /// TCP destination port
    TcpDst,
    /// UDP destination port
    UdpDst,
}

/// A single match field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Criterion {
    /// Match the port a frame arrived on
    InPort(PortNumber),
    /// Match the Ethernet type
    EthType(u16),
    /// Match the Ethernet source address
    EthSrc(MacAddress),
    /// Match the Ethernet destination address
    EthDst(MacAddress),
    /// Match the VLAN id
    VlanId(u16),
    /// Match the IP protocol
    IpProto(u8),
    /// Match an IPv4 source prefix
    Ipv4Src(Ipv4Prefix),
    /// Match an IPv4 destination prefix
    Ipv4Dst(Ipv4Prefix),
    /// Match a TCP destination port
    TcpDst(u16),
    /// Match a UDP destination port
    UdpDst(u16),
}

impl Criterion {
    /// Kind of this criterion
    pub fn kind(&self) -> CriterionType {
        match self {
            Criterion::InPort(_) => CriterionType::InPort,
            Criterion::EthType(_) => CriterionType::EthType,
            Criterion::EthSrc(_) => CriterionType::EthSrc,
            Criterion::EthDst(_) => CriterionType::EthDst,
            Criterion::VlanId(_) => CriterionType::VlanId,
            Criterion::IpProto(_) => CriterionType::IpProto,
            Criterion::Ipv4Src(_) => CriterionType::Ipv4Src,
            Criterion::Ipv4Dst(_) => CriterionType::Ipv4Dst,
            Criterion::TcpDst(_) => CriterionType::TcpDst,
            Criterion::UdpDst(_) => CriterionType::UdpDst,
        }
    }
}

/// Set of match criteria, at most one per [`CriterionType`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrafficSelector {
    criteria: BTreeMap<CriterionType, Criterion>,
}

impl TrafficSelector {
    /// Empty selector matching all traffic
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with this selector's criteria
    pub fn to_builder(&self) -> TrafficSelectorBuilder {
        TrafficSelectorBuilder {
            selector: self.clone(),
        }
    }

    /// Fresh builder
    pub fn builder() -> TrafficSelectorBuilder {
        TrafficSelectorBuilder::default()
    }

    /// Criterion of the given kind, if present
    pub fn criterion(&self, kind: CriterionType) -> Option<&Criterion> {
        self.criteria.get(&kind)
    }

    /// Ingress port criterion value, if present
    pub fn in_port(&self) -> Option<PortNumber> {
        match self.criteria.get(&CriterionType::InPort) {
            Some(Criterion::InPort(port)) => Some(*port),
            _ => None,
        }
    }

    /// All criteria in kind order
    pub fn criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.values()
    }

    /// True when no criteria are set
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

/// Builder for [`TrafficSelector`]; adding a criterion replaces any existing
/// criterion of the same kind.
#[derive(Debug, Clone, Default)]
pub struct TrafficSelectorBuilder {
    selector: TrafficSelector,
}

impl TrafficSelectorBuilder {
    /// Add or replace a criterion
    pub fn add(mut self, criterion: Criterion) -> Self {
        self.selector.criteria.insert(criterion.kind(), criterion);
        self
    }

    /// Match the ingress port
    pub fn match_in_port(self, port: PortNumber) -> Self {
        self.add(Criterion::InPort(port))
    }

    /// Match the Ethernet type
    pub fn match_eth_type(self, eth_type: u16) -> Self {
        self.add(Criterion::EthType(eth_type))
    }

    /// Match the Ethernet destination
    pub fn match_eth_dst(self, mac: MacAddress) -> Self {
        self.add(Criterion::EthDst(mac))
    }

    /// Match the VLAN id
    pub fn match_vlan_id(self, vlan: u16) -> Self {
        self.add(Criterion::VlanId(vlan))
    }

    /// Match an IPv4 destination prefix
    pub fn match_ipv4_dst(self, prefix: Ipv4Prefix) -> Self {
        self.add(Criterion::Ipv4Dst(prefix))
    }

    /// Finish
    pub fn build(self) -> TrafficSelector {
        self.selector
    }
}

/// A single treatment instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Instruction {
    /// Emit out of a port
    Output(PortNumber),
    /// Rewrite the VLAN id
    SetVlanId(u16),
    /// Push a VLAN header
    PushVlan,
    /// Pop the outer VLAN header
    PopVlan,
    /// Rewrite the Ethernet source
    SetEthSrc(MacAddress),
    /// Rewrite the Ethernet destination
    SetEthDst(MacAddress),
    /// Enqueue on a port queue
    SetQueue(u32),
    /// Drop the frame
    Drop,
}

/// Ordered list of instructions applied to matching traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrafficTreatment {
    instructions: Vec<Instruction>,
}

impl TrafficTreatment {
    /// Empty treatment
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh builder
    pub fn builder() -> TrafficTreatmentBuilder {
        TrafficTreatmentBuilder::default()
    }

    /// Builder seeded with this treatment's instructions
    pub fn to_builder(&self) -> TrafficTreatmentBuilder {
        TrafficTreatmentBuilder {
            treatment: self.clone(),
        }
    }

    /// Instructions in application order
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Output ports named by this treatment, in instruction order
    pub fn outputs(&self) -> impl Iterator<Item = PortNumber> + '_ {
        self.instructions.iter().filter_map(|i| match i {
            Instruction::Output(port) => Some(*port),
            _ => None,
        })
    }

    /// True when there are no instructions
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Builder for [`TrafficTreatment`].
#[derive(Debug, Clone, Default)]
pub struct TrafficTreatmentBuilder {
    treatment: TrafficTreatment,
}

impl TrafficTreatmentBuilder {
    /// Append an instruction
    pub fn add(mut self, instruction: Instruction) -> Self {
        self.treatment.instructions.push(instruction);
        self
    }

    /// Append an output instruction
    pub fn set_output(self, port: PortNumber) -> Self {
        self.add(Instruction::Output(port))
    }

    /// Append a VLAN rewrite
    pub fn set_vlan_id(self, vlan: u16) -> Self {
        self.add(Instruction::SetVlanId(vlan))
    }

    /// Append an Ethernet destination rewrite
    pub fn set_eth_dst(self, mac: MacAddress) -> Self {
        self.add(Instruction::SetEthDst(mac))
    }

    /// Finish
    pub fn build(self) -> TrafficTreatment {
        self.treatment
    }
}

/// Match discipline of a forwarding objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectiveFlag {
    /// Exact match on the given selector
    Specific,
    /// Fallback that may be widened by the pipeline
    Versatile,
}

/// Whether an objective is being added or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectiveOp {
    /// Program the objective
    Add,
    /// Remove a previously programmed objective
    Remove,
}

/// Device-local forwarding instruction: match, treatment, priority, flag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForwardingObjective {
    /// Traffic to match
    pub selector: TrafficSelector,
    /// What to do with it
    pub treatment: TrafficTreatment,
    /// Rule priority
    pub priority: u16,
    /// Match discipline
    pub flag: ObjectiveFlag,
    /// Never expires when true; otherwise `timeout_secs` applies
    pub permanent: bool,
    /// Idle timeout for non-permanent objectives
    pub timeout_secs: u32,
    /// Owning application
    pub app_id: AppId,
    /// Add or remove
    pub op: ObjectiveOp,
}

impl ForwardingObjective {
    /// Same objective with a different operation
    pub fn with_op(&self, op: ObjectiveOp) -> Self {
        Self {
            op,
            ..self.clone()
        }
    }

    /// Identity of the objective independent of its operation; two objectives
    /// with equal keys program the same rule.
    pub fn rule_key(&self) -> (TrafficSelector, u16, AppId) {
        (self.selector.clone(), self.priority, self.app_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_builder_replaces_same_kind() {
        let base = TrafficSelector::builder()
            .match_eth_type(0x0800)
            .match_in_port(PortNumber::new(1))
            .build();
        let rebuilt = base.to_builder().match_in_port(PortNumber::new(9)).build();
        assert_eq!(rebuilt.in_port(), Some(PortNumber::new(9)));
        assert_eq!(rebuilt.criteria().count(), 2);
        assert_eq!(base.in_port(), Some(PortNumber::new(1)));
    }

    #[test]
    fn test_treatment_outputs() {
        let t = TrafficTreatment::builder()
            .set_vlan_id(10)
            .set_output(PortNumber::new(2))
            .set_output(PortNumber::new(3))
            .build();
        let outputs: Vec<_> = t.outputs().collect();
        assert_eq!(outputs, vec![PortNumber::new(2), PortNumber::new(3)]);
        assert_eq!(t.instructions().len(), 3);
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddress([0, 0x1b, 0x21, 0xaa, 0xbb, 0x0c]);
        assert_eq!(mac.to_string(), "00:1b:21:aa:bb:0c");
    }
}
