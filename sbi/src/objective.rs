// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// At the reconciliation level, the daemon thinks in terms of subscribers,
/// services and bandwidth profiles.  Before anything reaches a device those
/// are marshalled into directives built from the small vocabulary below:
/// match criteria, treatment instructions, and the two directive families
/// (trap-style filters and match->treatment forwards).  Every field is
/// plain data so that directives can be logged, compared in tests, and
/// replicated alongside the parked work that references them.
use serde::Deserialize;
use serde::Serialize;

use common::network::MacAddr;
use common::network::VlanId;
use common::ports::PortNo;

use crate::MeterId;

/// Ethernet frame types the access control plane traps on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum EthType {
    Eapol,
    Ipv4,
    Ipv6,
    Lldp,
    PppoeDiscovery,
}

impl EthType {
    /// The on-the-wire ethertype value.
    pub fn value(&self) -> u16 {
        match self {
            EthType::Eapol => 0x888e,
            EthType::Ipv4 => 0x0800,
            EthType::Ipv6 => 0x86dd,
            EthType::Lldp => 0x88cc,
            EthType::PppoeDiscovery => 0x8863,
        }
    }
}

/// IP protocols matched by trap directives.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum IpProto {
    Igmp,
    Udp,
}

impl IpProto {
    pub fn value(&self) -> u8 {
        match self {
            IpProto::Igmp => 2,
            IpProto::Udp => 17,
        }
    }
}

/// A single field of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    InPort(PortNo),
    EthType(EthType),
    IpProto(IpProto),
    UdpSrc(u16),
    UdpDst(u16),
    Vlan(VlanId),
    InnerVlan(VlanId),
    VlanPcp(u8),
    Metadata(u64),
    EthDst(MacAddr),
}

/// A single action of a treatment.  Order matters: VLAN pushes and rewrites
/// are applied in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Meter(MeterId),
    WriteMetadata(u64),
    PushVlan,
    PopVlan,
    SetVlan(VlanId),
    SetVlanPcp(u8),
    Output(PortNo),
}

/// An ordered set of match criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrafficSelector {
    criteria: Vec<Criterion>,
}

impl TrafficSelector {
    pub fn builder() -> TrafficSelectorBuilder {
        TrafficSelectorBuilder::default()
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn in_port(&self) -> Option<PortNo> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::InPort(p) => Some(*p),
            _ => None,
        })
    }

    pub fn eth_type(&self) -> Option<EthType> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::EthType(t) => Some(*t),
            _ => None,
        })
    }

    pub fn ip_proto(&self) -> Option<IpProto> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::IpProto(p) => Some(*p),
            _ => None,
        })
    }

    pub fn udp_src(&self) -> Option<u16> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::UdpSrc(p) => Some(*p),
            _ => None,
        })
    }

    pub fn vlan(&self) -> Option<VlanId> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::Vlan(v) => Some(*v),
            _ => None,
        })
    }

    pub fn inner_vlan(&self) -> Option<VlanId> {
        self.criteria.iter().find_map(|c| match c {
            Criterion::InnerVlan(v) => Some(*v),
            _ => None,
        })
    }
}

#[derive(Default)]
pub struct TrafficSelectorBuilder {
    criteria: Vec<Criterion>,
}

impl TrafficSelectorBuilder {
    pub fn match_criterion(mut self, c: Criterion) -> Self {
        self.criteria.push(c);
        self
    }

    pub fn match_in_port(self, port: PortNo) -> Self {
        self.match_criterion(Criterion::InPort(port))
    }

    pub fn match_vlan(self, vlan: VlanId) -> Self {
        self.match_criterion(Criterion::Vlan(vlan))
    }

    pub fn match_inner_vlan(self, vlan: VlanId) -> Self {
        self.match_criterion(Criterion::InnerVlan(vlan))
    }

    pub fn build(self) -> TrafficSelector {
        TrafficSelector { criteria: self.criteria }
    }
}

/// An ordered list of treatment instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrafficTreatment {
    instructions: Vec<Instruction>,
}

impl TrafficTreatment {
    pub fn builder() -> TrafficTreatmentBuilder {
        TrafficTreatmentBuilder::default()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn output(&self) -> Option<PortNo> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Output(p) => Some(*p),
            _ => None,
        })
    }

    pub fn meters(&self) -> Vec<MeterId> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Meter(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    /// The VLAN ids this treatment rewrites, in application order.
    pub fn set_vlans(&self) -> Vec<VlanId> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::SetVlan(v) => Some(*v),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub struct TrafficTreatmentBuilder {
    instructions: Vec<Instruction>,
}

impl TrafficTreatmentBuilder {
    pub fn meter(mut self, meter: MeterId) -> Self {
        self.instructions.push(Instruction::Meter(meter));
        self
    }

    pub fn write_metadata(mut self, metadata: u64) -> Self {
        self.instructions.push(Instruction::WriteMetadata(metadata));
        self
    }

    pub fn push_vlan(mut self) -> Self {
        self.instructions.push(Instruction::PushVlan);
        self
    }

    pub fn pop_vlan(mut self) -> Self {
        self.instructions.push(Instruction::PopVlan);
        self
    }

    pub fn set_vlan(mut self, vlan: VlanId) -> Self {
        self.instructions.push(Instruction::SetVlan(vlan));
        self
    }

    pub fn set_vlan_pcp(mut self, pcp: u8) -> Self {
        self.instructions.push(Instruction::SetVlanPcp(pcp));
        self
    }

    pub fn output(mut self, port: PortNo) -> Self {
        self.instructions.push(Instruction::Output(port));
        self
    }

    pub fn build(self) -> TrafficTreatment {
        TrafficTreatment { instructions: self.instructions }
    }
}

/// Whether a directive installs or withdraws state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ObjectiveVerb {
    Add,
    Remove,
}

/// A trap-style directive: packets matching the key and conditions are
/// handed to the treatment, which for this control plane always ends at the
/// controller port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringObjective {
    pub verb: ObjectiveVerb,
    pub app: String,
    /// The anchoring criterion; always the ingress port here.
    pub key: Criterion,
    pub conditions: Vec<Criterion>,
    pub meta: TrafficTreatment,
    pub priority: u16,
}

impl FilteringObjective {
    pub fn builder(
        app: impl ToString,
        in_port: PortNo,
    ) -> FilteringObjectiveBuilder {
        FilteringObjectiveBuilder {
            app: app.to_string(),
            key: Criterion::InPort(in_port),
            conditions: Vec::new(),
            meta: TrafficTreatment::default(),
            priority: 0,
        }
    }

    /// The full match of this directive, key included, in the form the
    /// driver reports it back.
    pub fn selector(&self) -> TrafficSelector {
        let mut b = TrafficSelector::builder().match_criterion(self.key);
        for c in &self.conditions {
            b = b.match_criterion(*c);
        }
        b.build()
    }
}

pub struct FilteringObjectiveBuilder {
    app: String,
    key: Criterion,
    conditions: Vec<Criterion>,
    meta: TrafficTreatment,
    priority: u16,
}

impl FilteringObjectiveBuilder {
    pub fn condition(mut self, c: Criterion) -> Self {
        self.conditions.push(c);
        self
    }

    pub fn meta(mut self, t: TrafficTreatment) -> Self {
        self.meta = t;
        self
    }

    pub fn priority(mut self, p: u16) -> Self {
        self.priority = p;
        self
    }

    fn finish(self, verb: ObjectiveVerb) -> FilteringObjective {
        FilteringObjective {
            verb,
            app: self.app,
            key: self.key,
            conditions: self.conditions,
            meta: self.meta,
            priority: self.priority,
        }
    }

    pub fn add(self) -> FilteringObjective {
        self.finish(ObjectiveVerb::Add)
    }

    pub fn remove(self) -> FilteringObjective {
        self.finish(ObjectiveVerb::Remove)
    }

    pub fn verb(self, verb: ObjectiveVerb) -> FilteringObjective {
        self.finish(verb)
    }
}

/// A match->treatment forwarding directive.  All of the daemon's forwards
/// are versatile and permanent; the driver owns any further refinement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingObjective {
    pub verb: ObjectiveVerb,
    pub app: String,
    pub selector: TrafficSelector,
    pub treatment: TrafficTreatment,
    pub priority: u16,
}

impl ForwardingObjective {
    pub fn builder(app: impl ToString) -> ForwardingObjectiveBuilder {
        ForwardingObjectiveBuilder {
            app: app.to_string(),
            selector: TrafficSelector::default(),
            treatment: TrafficTreatment::default(),
            priority: 0,
        }
    }
}

pub struct ForwardingObjectiveBuilder {
    app: String,
    selector: TrafficSelector,
    treatment: TrafficTreatment,
    priority: u16,
}

impl ForwardingObjectiveBuilder {
    pub fn selector(mut self, s: TrafficSelector) -> Self {
        self.selector = s;
        self
    }

    pub fn treatment(mut self, t: TrafficTreatment) -> Self {
        self.treatment = t;
        self
    }

    pub fn priority(mut self, p: u16) -> Self {
        self.priority = p;
        self
    }

    fn finish(self, verb: ObjectiveVerb) -> ForwardingObjective {
        ForwardingObjective {
            verb,
            app: self.app,
            selector: self.selector,
            treatment: self.treatment,
            priority: self.priority,
        }
    }

    pub fn add(self) -> ForwardingObjective {
        self.finish(ObjectiveVerb::Add)
    }

    pub fn remove(self) -> ForwardingObjective {
        self.finish(ObjectiveVerb::Remove)
    }

    pub fn verb(self, verb: ObjectiveVerb) -> ForwardingObjective {
        self.finish(verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_accessors() {
        let s = TrafficSelector::builder()
            .match_in_port(PortNo::new(16))
            .match_criterion(Criterion::EthType(EthType::Eapol))
            .match_vlan(VlanId::new(101).unwrap())
            .build();
        assert_eq!(s.in_port(), Some(PortNo::new(16)));
        assert_eq!(s.eth_type(), Some(EthType::Eapol));
        assert_eq!(s.vlan(), Some(VlanId::new(101).unwrap()));
        assert_eq!(s.inner_vlan(), None);
    }

    #[test]
    fn test_treatment_ordering_is_preserved() {
        let t = TrafficTreatment::builder()
            .push_vlan()
            .set_vlan(VlanId::new(101).unwrap())
            .push_vlan()
            .set_vlan(VlanId::new(7).unwrap())
            .output(PortNo::new(2))
            .build();
        assert_eq!(
            t.set_vlans(),
            vec![VlanId::new(101).unwrap(), VlanId::new(7).unwrap()]
        );
        assert_eq!(t.output(), Some(PortNo::new(2)));
    }

    #[test]
    fn test_filter_selector_includes_key() {
        let f = FilteringObjective::builder("app", PortNo::new(16))
            .condition(Criterion::EthType(EthType::Lldp))
            .priority(10000)
            .add();
        let s = f.selector();
        assert_eq!(s.in_port(), Some(PortNo::new(16)));
        assert_eq!(s.eth_type(), Some(EthType::Lldp));
    }

    #[test]
    fn test_objective_roundtrip_serde() {
        let f = ForwardingObjective::builder("app")
            .selector(
                TrafficSelector::builder()
                    .match_in_port(PortNo::new(2))
                    .match_vlan(VlanId::new(7).unwrap())
                    .build(),
            )
            .treatment(
                TrafficTreatment::builder()
                    .pop_vlan()
                    .output(PortNo::new(16))
                    .build(),
            )
            .priority(1000)
            .add();
        let json = serde_json::to_string(&f).unwrap();
        let back: ForwardingObjective = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
