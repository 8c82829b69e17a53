// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Translation of service definitions into southbound directives.  Every
//! function here is a pure function of its inputs: no I/O, no state, so that
//! the same service always produces the same directives and the reconciler
//! can re-emit them idempotently.

use common::network::MacAddr;
use common::network::VlanId;
use common::ports::PortNo;
use sbi::Criterion;
use sbi::EthType;
use sbi::FilteringObjective;
use sbi::ForwardingObjective;
use sbi::IpProto;
use sbi::MeterId;
use sbi::ObjectiveVerb;
use sbi::TrafficSelector;
use sbi::TrafficTreatment;
use sbi::TrafficTreatmentBuilder;

use crate::subscriber::UniTagInformation;
use crate::subscriber::NONE_TP_ID;

/// Priority of trap (filtering) directives.
pub const MAX_PRIORITY: u16 = 10000;
/// Priority of data-plane forwarding directives.
pub const MIN_PRIORITY: u16 = 1000;

/// The reserved VLAN tagging the pre-provisioning authentication trap.
pub const EAPOL_DEFAULT_VLAN: VlanId = VlanId::from_raw(4091);

/// Builds directives for one application id and one default technology
/// profile.
pub struct FlowBuilder {
    app: String,
    default_tech_profile_id: i32,
}

impl FlowBuilder {
    pub fn new(app: impl ToString, default_tech_profile_id: i32) -> Self {
        FlowBuilder { app: app.to_string(), default_tech_profile_id }
    }

    fn effective_tp(&self, tp_id: i32) -> i32 {
        if tp_id == NONE_TP_ID {
            self.default_tech_profile_id
        } else {
            tp_id
        }
    }

    // Write-metadata layout, MSB first: bytes [0..1] inner VLAN id, bytes
    // [2..3] technology profile id, bytes [4..7] egress port.  No inner
    // VLAN means zero in the top bytes.
    fn vid_bits(vlan: Option<VlanId>) -> u64 {
        match vlan {
            Some(v) if !v.is_none() => (v.id() as u64) << 48,
            _ => 0,
        }
    }

    /// Metadata carried by data-plane forwards.
    fn metadata(&self, inner: VlanId, tp_id: i32, egress: PortNo) -> u64 {
        Self::vid_bits(Some(inner))
            | (self.effective_tp(tp_id) as u64 & 0xffff) << 32
            | egress.as_u32() as u64
    }

    /// Metadata carried by trap directives: no egress port; the low bits
    /// optionally carry the upstream OLT meter id.
    fn trap_metadata(
        &self,
        vlan: Option<VlanId>,
        tp_id: i32,
        olt_meter: Option<MeterId>,
    ) -> u64 {
        Self::vid_bits(vlan)
            | (self.effective_tp(tp_id) as u64 & 0xffff) << 32
            | olt_meter.map(|m| m.as_u32() as u64).unwrap_or(0)
    }

    /// The authentication trap installed on every enabled UNI before any
    /// subscriber is provisioned, tagged with the reserved VLAN and metered
    /// by the default bandwidth profile.
    pub fn default_eapol_trap(
        &self,
        uni: PortNo,
        meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        let mut t = TrafficTreatment::builder();
        if let Some(m) = meter {
            t = t.meter(m);
        }
        let t = t
            .write_metadata(self.trap_metadata(None, NONE_TP_ID, None))
            .push_vlan()
            .set_vlan(EAPOL_DEFAULT_VLAN)
            .output(PortNo::CONTROLLER);

        FilteringObjective::builder(&self.app, uni)
            .condition(Criterion::EthType(EthType::Eapol))
            .meta(t.build())
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// The per-service authentication trap, tagged with the service's C tag.
    /// Mutually exclusive with the default trap on the same UNI.
    pub fn eapol_trap(
        &self,
        uni: PortNo,
        tag: &UniTagInformation,
        meter: Option<MeterId>,
        olt_meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        let mut t = TrafficTreatment::builder();
        if let Some(m) = meter {
            t = t.meter(m);
        }
        let t = t
            .write_metadata(self.trap_metadata(
                Some(tag.pon_c_tag),
                tag.technology_profile_id,
                olt_meter,
            ))
            .push_vlan()
            .set_vlan(tag.pon_c_tag)
            .output(PortNo::CONTROLLER);

        FilteringObjective::builder(&self.app, uni)
            .condition(Criterion::EthType(EthType::Eapol))
            .meta(t.build())
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// A DHCP trap for one direction and one IP version.  On UNIs
    /// (upstream) the trap matches the UNI VLAN and rewrites to the
    /// service's C tag; on NNIs (downstream) it matches bare.
    pub fn dhcp_trap(
        &self,
        port: PortNo,
        v4: bool,
        upstream: bool,
        tag: Option<&UniTagInformation>,
        meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        let (udp_src, udp_dst) = match (v4, upstream) {
            (true, true) => (68, 67),
            (true, false) => (67, 68),
            (false, true) => (547, 546),
            (false, false) => (546, 547),
        };
        let eth = if v4 { EthType::Ipv4 } else { EthType::Ipv6 };

        let mut t = TrafficTreatment::builder();
        if let Some(m) = meter {
            t = t.meter(m);
        }
        let tp_id = tag.map(|ti| ti.technology_profile_id).unwrap_or(NONE_TP_ID);
        if tp_id != NONE_TP_ID {
            let uni_tag_match =
                tag.map(|ti| ti.uni_tag_match).unwrap_or(VlanId::ANY);
            t = t.write_metadata(self.trap_metadata(
                Some(uni_tag_match),
                tp_id,
                None,
            ));
        }

        let mut f = FilteringObjective::builder(&self.app, port)
            .condition(Criterion::EthType(eth))
            .condition(Criterion::IpProto(IpProto::Udp))
            .condition(Criterion::UdpSrc(udp_src))
            .condition(Criterion::UdpDst(udp_dst));

        // VLAN rewrite and PCP matching only happen upstream
        if upstream {
            if let Some(tag) = tag {
                t = t.set_vlan(tag.pon_c_tag);
                if !tag.uni_tag_match.is_no_vid() {
                    f = f.condition(Criterion::Vlan(tag.uni_tag_match));
                }
                if let Some(pcp) = tag.us_pon_c_tag_priority {
                    t = t.set_vlan_pcp(pcp);
                }
            }
        }

        f.meta(t.output(PortNo::CONTROLLER).build())
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// An IGMP trap.  Upstream carries the service's VLAN/PCP handling;
    /// the downstream (NNI) variant traps bare IGMP.
    pub fn igmp_trap(
        &self,
        port: PortNo,
        upstream: bool,
        tag: Option<&UniTagInformation>,
        meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        let mut t = TrafficTreatment::builder();
        let mut f = FilteringObjective::builder(&self.app, port)
            .condition(Criterion::EthType(EthType::Ipv4))
            .condition(Criterion::IpProto(IpProto::Igmp));

        if upstream {
            if let Some(tag) = tag {
                if tag.technology_profile_id != NONE_TP_ID {
                    t = t.write_metadata(self.trap_metadata(
                        None,
                        tag.technology_profile_id,
                        None,
                    ));
                }
                if let Some(m) = meter {
                    t = t.meter(m);
                }
                if !tag.uni_tag_match.is_no_vid() {
                    f = f.condition(Criterion::Vlan(tag.uni_tag_match));
                }
                if !tag.pon_c_tag.is_no_vid() {
                    t = t.set_vlan(tag.pon_c_tag);
                }
                if let Some(pcp) = tag.us_pon_c_tag_priority {
                    t = t.set_vlan_pcp(pcp);
                }
            }
        }

        f.meta(t.output(PortNo::CONTROLLER).build())
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// A PPPoE-discovery trap.
    pub fn pppoed_trap(
        &self,
        port: PortNo,
        upstream: bool,
        tag: Option<&UniTagInformation>,
        meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        let mut t = TrafficTreatment::builder();
        if let Some(m) = meter {
            t = t.meter(m);
        }
        let tp_id = tag.map(|ti| ti.technology_profile_id).unwrap_or(NONE_TP_ID);
        if tp_id != NONE_TP_ID {
            let c_tag = tag.map(|ti| ti.pon_c_tag).unwrap_or(VlanId::NONE);
            t = t.write_metadata(self.trap_metadata(Some(c_tag), tp_id, None));
        }

        let mut f = FilteringObjective::builder(&self.app, port)
            .condition(Criterion::EthType(EthType::PppoeDiscovery));

        if upstream {
            if let Some(tag) = tag {
                t = t.set_vlan(tag.pon_c_tag);
                if !tag.uni_tag_match.is_no_vid() {
                    f = f.condition(Criterion::Vlan(tag.uni_tag_match));
                }
                if let Some(pcp) = tag.us_pon_c_tag_priority {
                    t = t.set_vlan_pcp(pcp);
                }
            }
        }

        f.meta(t.output(PortNo::CONTROLLER).build())
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// The LLDP trap installed on NNI ports.
    pub fn lldp_trap(
        &self,
        nni: PortNo,
        verb: ObjectiveVerb,
    ) -> FilteringObjective {
        FilteringObjective::builder(&self.app, nni)
            .condition(Criterion::EthType(EthType::Lldp))
            .meta(
                TrafficTreatment::builder()
                    .output(PortNo::CONTROLLER)
                    .build(),
            )
            .priority(MAX_PRIORITY)
            .verb(verb)
    }

    /// The UNI -> NNI data-plane forward for one service.
    pub fn up_forward(
        &self,
        uplink: PortNo,
        uni: PortNo,
        tag: &UniTagInformation,
        meter: Option<MeterId>,
        olt_meter: Option<MeterId>,
        verb: ObjectiveVerb,
    ) -> ForwardingObjective {
        let selector = TrafficSelector::builder()
            .match_in_port(uni)
            .match_vlan(tag.uni_tag_match)
            .build();

        let mut t = TrafficTreatment::builder();
        if !tag.pon_c_tag.is_any() {
            t = t.push_vlan().set_vlan(tag.pon_c_tag);
        }
        // an ANY S tag means single-tagged transport: strip whatever the
        // subscriber sent instead of stacking an outer tag
        if tag.pon_s_tag.is_any() {
            t = t.pop_vlan();
        }
        if let Some(pcp) = tag.us_pon_c_tag_priority {
            t = t.set_vlan_pcp(pcp);
        }
        if !tag.pon_s_tag.is_any() {
            t = t.push_vlan().set_vlan(tag.pon_s_tag);
            if let Some(pcp) = tag.us_pon_s_tag_priority {
                t = t.set_vlan_pcp(pcp);
            }
        }
        t = t.write_metadata(self.metadata(
            tag.pon_c_tag,
            tag.technology_profile_id,
            uplink,
        ));
        t = Self::meters(t, meter, olt_meter);

        ForwardingObjective::builder(&self.app)
            .selector(selector)
            .treatment(t.output(uplink).build())
            .priority(MIN_PRIORITY)
            .verb(verb)
    }

    /// The NNI -> UNI data-plane forward for one service.
    pub fn down_forward(
        &self,
        uplink: PortNo,
        uni: PortNo,
        tag: &UniTagInformation,
        meter: Option<MeterId>,
        olt_meter: Option<MeterId>,
        dst_mac: Option<MacAddr>,
        verb: ObjectiveVerb,
    ) -> ForwardingObjective {
        let mut s = TrafficSelector::builder()
            .match_in_port(uplink)
            .match_vlan(tag.pon_s_tag)
            .match_inner_vlan(tag.pon_c_tag);
        if !tag.pon_c_tag.is_any() {
            s = s
                .match_criterion(Criterion::Metadata(tag.pon_c_tag.id() as u64));
        }
        if let Some(pcp) = tag.ds_pon_s_tag_priority {
            s = s.match_criterion(Criterion::VlanPcp(pcp));
        }
        if let Some(mac) = dst_mac {
            s = s.match_criterion(Criterion::EthDst(mac));
        }

        let mut t = TrafficTreatment::builder().pop_vlan();
        // remark the inner header on the way out
        if let Some(pcp) = tag.us_pon_c_tag_priority {
            t = t.set_vlan_pcp(pcp);
        }
        if !tag.uni_tag_match.is_none() && !tag.pon_c_tag.is_any() {
            t = t.set_vlan(tag.uni_tag_match);
        }
        t = t.write_metadata(self.metadata(
            tag.pon_c_tag,
            tag.technology_profile_id,
            uni,
        ));
        t = Self::meters(t, meter, olt_meter);

        ForwardingObjective::builder(&self.app)
            .selector(s.build())
            .treatment(t.output(uni).build())
            .priority(MIN_PRIORITY)
            .verb(verb)
    }

    /// One direction of the transparent double-tagged pair installed when
    /// the operator provisions a single (sTag, cTag, tpId) service.
    pub fn transparent_forward(
        &self,
        uplink: PortNo,
        uni: PortNo,
        tag: &UniTagInformation,
        meter: Option<MeterId>,
        upstream: bool,
        verb: ObjectiveVerb,
    ) -> ForwardingObjective {
        let (in_port, out_port) =
            if upstream { (uni, uplink) } else { (uplink, uni) };
        let metadata_vlan =
            if upstream { tag.pon_s_tag } else { tag.pon_c_tag };

        let selector = TrafficSelector::builder()
            .match_vlan(tag.pon_s_tag)
            .match_in_port(in_port)
            .match_inner_vlan(tag.pon_c_tag)
            .build();

        let mut t = TrafficTreatment::builder();
        if let Some(m) = meter {
            t = t.meter(m);
        }
        let t = t
            .write_metadata(self.metadata(
                metadata_vlan,
                tag.technology_profile_id,
                out_port,
            ))
            .output(out_port);

        ForwardingObjective::builder(&self.app)
            .selector(selector)
            .treatment(t.build())
            .priority(MIN_PRIORITY)
            .verb(verb)
    }

    fn meters(
        mut t: TrafficTreatmentBuilder,
        meter: Option<MeterId>,
        olt_meter: Option<MeterId>,
    ) -> TrafficTreatmentBuilder {
        if let Some(m) = meter {
            t = t.meter(m);
        }
        if let Some(m) = olt_meter {
            t = t.meter(m);
        }
        t
    }
}
