// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Read-model structs returned by the listing operations.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use common::network::VlanId;
use common::ports::ConnectPoint;

use crate::status::OltFlowsStatus;
use crate::status::OltPortStatus;
use crate::status::ServiceKey;

/// One programmed (port, service), independent of flow state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgrammedSubscriber {
    pub connect_point: ConnectPoint,
    pub port_name: String,
    pub service_name: String,
    pub s_tag: VlanId,
    pub c_tag: VlanId,
    pub tp_id: i32,
}

impl From<&ServiceKey> for ProgrammedSubscriber {
    fn from(key: &ServiceKey) -> Self {
        ProgrammedSubscriber {
            connect_point: key.port.connect_point(),
            port_name: key.port.name.clone(),
            service_name: key.tag.service_name.clone(),
            s_tag: key.tag.pon_s_tag,
            c_tag: key.tag.pon_c_tag,
            tp_id: key.tag.technology_profile_id,
        }
    }
}

/// The tracked flow status of one (connect point, service).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceStatus {
    pub connect_point: ConnectPoint,
    pub service_name: String,
    pub s_tag: VlanId,
    pub c_tag: VlanId,
    pub tp_id: i32,
    pub default_eapol: OltFlowsStatus,
    pub subscriber_flows: OltFlowsStatus,
    pub dhcp: OltFlowsStatus,
}

impl ServiceStatus {
    pub fn new(key: &ServiceKey, status: OltPortStatus) -> Self {
        ServiceStatus {
            connect_point: key.port.connect_point(),
            service_name: key.tag.service_name.clone(),
            s_tag: key.tag.pon_s_tag,
            c_tag: key.tag.pon_c_tag,
            tp_id: key.tag.technology_profile_id,
            default_eapol: status.default_eapol,
            subscriber_flows: status.subscriber_flows,
            dhcp: status.dhcp,
        }
    }
}
