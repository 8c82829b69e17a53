// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Reverse reconciliation: the driver's rule events are folded back into
//! the status store, so that what the store claims converges on what the
//! device actually carries.

use slog::debug;
use slog::warn;

use common::network::VlanId;
use common::ports::ConnectPoint;
use sbi::EthType;
use sbi::FlowRule;
use sbi::FlowRuleEvent;
use sbi::FlowRuleEventKind;
use sbi::IpProto;

use crate::flow::EAPOL_DEFAULT_VLAN;
use crate::status::AccessDevicePort;
use crate::status::OltFlowsStatus;
use crate::status::ServiceKey;
use crate::status::StatusUpdate;
use crate::Olt;

impl Olt {
    /// Fold one driver rule event into the status store.  Rules from other
    /// applications, rules on foreign devices, and rule families the store
    /// doesn't track are dropped.
    pub fn handle_flow_rule_event(&self, ev: FlowRuleEvent) {
        let rule = &ev.rule;
        if rule.app != crate::APP_NAME {
            return;
        }
        if !self.is_device_mine(&rule.device) {
            debug!(self.log, "rule event for foreign device";
                "device" => %rule.device);
            return;
        }

        let status = match ev.kind {
            FlowRuleEventKind::AddRequested => OltFlowsStatus::PendingAdd,
            FlowRuleEventKind::Added => OltFlowsStatus::Added,
            FlowRuleEventKind::RemoveRequested => OltFlowsStatus::PendingRemove,
            FlowRuleEventKind::Removed => OltFlowsStatus::Removed,
        };
        let Some(in_port) = rule.selector.in_port() else { return };
        let cp = ConnectPoint::new(rule.device.clone(), in_port);

        if is_default_eapol_rule(rule) {
            let Some(port) = self.inventory.port(&cp) else { return };
            let key = ServiceKey::default_eapol(AccessDevicePort::new(
                &cp.device, &port,
            ));
            self.status.update(&key, StatusUpdate::default_eapol(status));
            return;
        }

        if is_dhcp_rule(rule) {
            if self.is_nni_port(&rule.device, in_port) {
                let Some(port) = self.inventory.port(&cp) else { return };
                let key =
                    ServiceKey::nni(AccessDevicePort::new(&cp.device, &port));
                self.status.update(&key, StatusUpdate::dhcp(status));
                return;
            }
            // on a UNI the service is identified by the VLAN the trap
            // pushes
            let Some(vlan) = rule.treatment.set_vlans().first().copied()
            else {
                debug!(self.log, "dhcp rule without a pushed vlan";
                    "cp" => %cp);
                return;
            };
            if let Some(key) = self.service_key_by_vlan(&cp, vlan) {
                self.status.update(&key, StatusUpdate::dhcp(status));
            }
            return;
        }

        if let Some(vlan) = rule.selector.vlan() {
            // a dataplane rule; NNI dataplane flows are deliberately not
            // tracked (one per subscriber would balloon the store)
            if self.is_nni_port(&rule.device, in_port) {
                return;
            }
            if let Some(key) = self.service_key_by_vlan(&cp, vlan) {
                self.status
                    .update(&key, StatusUpdate::subscriber_flows(status));
            }
        }
    }

    /// Find the subscriber service a rule's VLAN refers to.  First match
    /// wins, as it always has; subscribers with overlapping VLAN semantics
    /// across services get a warning.
    fn service_key_by_vlan(
        &self,
        cp: &ConnectPoint,
        vlan: VlanId,
    ) -> Option<ServiceKey> {
        let port = self.inventory.port(cp)?;
        let sub = self.subscribers.subscriber(&port.name)?;

        let mut matches = sub.uni_tag_list.iter().filter(|t| {
            t.pon_c_tag == vlan || t.pon_s_tag == vlan || t.uni_tag_match == vlan
        });
        let found = matches.next()?;
        if matches.next().is_some() {
            warn!(self.log,
                "vlan matches more than one service, taking the first";
                "cp" => %cp, "vlan" => %vlan);
        }
        Some(ServiceKey::new(
            AccessDevicePort::new(&cp.device, &port),
            found.clone(),
        ))
    }
}

fn is_default_eapol_rule(rule: &FlowRule) -> bool {
    rule.selector.eth_type() == Some(EthType::Eapol)
        && rule.treatment.set_vlans().contains(&EAPOL_DEFAULT_VLAN)
}

fn is_dhcp_rule(rule: &FlowRule) -> bool {
    rule.selector.ip_proto() == Some(IpProto::Udp)
        && matches!(rule.selector.udp_src(), Some(67) | Some(68))
}
