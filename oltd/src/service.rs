// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The operator-facing surface: provisioning calls, read-only listings,
//! and the access-device event sink.

use chrono::DateTime;
use chrono::Utc;
use slog::info;
use slog::warn;

use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;

use crate::reconcile::ReconcileTask;
use crate::subscriber::UniTagInformation;
use crate::types::OltError;
use crate::types::OltResult;
use crate::views;
use crate::Olt;

/// What happened on an access device, as seen by downstream consumers
/// (authentication, DHCP relay, multicast control).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDeviceEventKind {
    DeviceConnected,
    DeviceDisconnected,
    UniAdded,
    UniRemoved,
    SubscriberUniTagRegistered,
    SubscriberUniTagUnregistered,
    SubscriberUniTagRegistrationFailed,
    SubscriberUniTagUnregistrationFailed,
}

#[derive(Debug, Clone)]
pub struct AccessDeviceEvent {
    pub kind: AccessDeviceEventKind,
    pub device: DeviceId,
    pub port: Option<PortNo>,
    pub s_tag: Option<VlanId>,
    pub c_tag: Option<VlanId>,
    pub tp_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl Olt {
    pub(crate) fn post_device_event(
        &self,
        kind: AccessDeviceEventKind,
        device: &DeviceId,
    ) {
        self.post(AccessDeviceEvent {
            kind,
            device: device.clone(),
            port: None,
            s_tag: None,
            c_tag: None,
            tp_id: None,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn post_port_event(
        &self,
        kind: AccessDeviceEventKind,
        device: &DeviceId,
        port: PortNo,
    ) {
        self.post(AccessDeviceEvent {
            kind,
            device: device.clone(),
            port: Some(port),
            s_tag: None,
            c_tag: None,
            tp_id: None,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn post_subscriber_event(
        &self,
        kind: AccessDeviceEventKind,
        cp: &ConnectPoint,
        tag: &UniTagInformation,
    ) {
        self.post(AccessDeviceEvent {
            kind,
            device: cp.device.clone(),
            port: Some(cp.port),
            s_tag: Some(tag.pon_s_tag),
            c_tag: Some(tag.pon_c_tag),
            tp_id: Some(tag.technology_profile_id),
            timestamp: Utc::now(),
        });
    }

    fn post(&self, event: AccessDeviceEvent) {
        // no subscribers is fine; events are fire-and-forget
        let _ = self.access_events.send(event);
    }

    /// Provision the full service suite of the subscriber on a connect
    /// point.  Validation is synchronous; the installation itself runs as a
    /// reconciliation task.
    pub fn provision_subscriber(&self, cp: &ConnectPoint) -> OltResult<()> {
        info!(self.log, "call to provision subscriber"; "cp" => %cp);
        if !self.is_device_mine(&cp.device) {
            return Ok(());
        }
        let Some(port) = self.inventory.port(cp) else {
            return Err(OltError::BadRequest(format!(
                "invalid connect point {cp}"
            )));
        };
        if self.subscribers.subscriber(&port.name).is_none() {
            warn!(self.log, "no subscriber found"; "cp" => %cp,
                "port_name" => &port.name);
            return Err(OltError::NotConfigured(format!(
                "no subscriber for {cp}"
            )));
        }
        self.submit(ReconcileTask::Provision { cp: cp.clone() });
        Ok(())
    }

    /// Remove whatever is programmed for the subscriber on a connect
    /// point.  Removing an unknown subscriber succeeds, so operator queues
    /// drain.
    pub fn remove_subscriber(&self, cp: &ConnectPoint) -> OltResult<()> {
        info!(self.log, "call to un-provision subscriber"; "cp" => %cp);
        if !self.is_device_mine(&cp.device) {
            return Ok(());
        }
        self.submit(ReconcileTask::Remove { cp: cp.clone() });
        Ok(())
    }

    /// Provision by subscriber id.  With no tag selectors this is the full
    /// suite; with all three of (sTag, cTag, tpId) it is the transparent
    /// pair of that one service; anything in between is malformed.
    pub fn provision_subscriber_by_id(
        &self,
        id: &str,
        s_tag: Option<VlanId>,
        c_tag: Option<VlanId>,
        tp_id: Option<i32>,
    ) -> OltResult<()> {
        let cp = self.find_connect_point(id)?;
        match (s_tag, c_tag, tp_id) {
            (None, None, _) => self.provision_subscriber(&cp),
            (Some(s_tag), Some(c_tag), Some(tp_id)) => {
                if !self.is_device_mine(&cp.device) {
                    return Ok(());
                }
                if self.find_tag(&cp, c_tag, s_tag, tp_id).is_none() {
                    return Err(OltError::BadRequest(format!(
                        "no service with sTag {s_tag} cTag {c_tag} tpId {tp_id} on {cp}"
                    )));
                }
                self.submit(ReconcileTask::ProvisionService {
                    cp,
                    c_tag,
                    s_tag,
                    tp_id,
                });
                Ok(())
            }
            _ => Err(OltError::BadRequest(
                "either both tags and a technology profile, or neither"
                    .to_string(),
            )),
        }
    }

    pub fn remove_subscriber_by_id(
        &self,
        id: &str,
        s_tag: Option<VlanId>,
        c_tag: Option<VlanId>,
        tp_id: Option<i32>,
    ) -> OltResult<()> {
        let cp = self.find_connect_point(id)?;
        match (s_tag, c_tag, tp_id) {
            (None, None, _) => self.remove_subscriber(&cp),
            (Some(s_tag), Some(c_tag), Some(tp_id)) => {
                if !self.is_device_mine(&cp.device) {
                    return Ok(());
                }
                self.submit(ReconcileTask::RemoveService {
                    cp,
                    c_tag,
                    s_tag,
                    tp_id,
                });
                Ok(())
            }
            _ => Err(OltError::BadRequest(
                "either both tags and a technology profile, or neither"
                    .to_string(),
            )),
        }
    }

    /// Clear every flow, status entry, provisioned entry and meter binding
    /// of a device.
    pub fn purge_device_flows(&self, device: &DeviceId) -> OltResult<()> {
        if !self.is_device_mine(device) {
            return Ok(());
        }
        self.submit(ReconcileTask::PurgeDevice { device: device.clone() });
        Ok(())
    }

    /// The services the operator has programmed, whether or not their
    /// flows are currently installed.
    pub fn programmed_subscribers(&self) -> Vec<views::ProgrammedSubscriber> {
        self.status
            .programmed()
            .into_iter()
            .map(|key| views::ProgrammedSubscriber::from(&key))
            .collect()
    }

    /// Flow status per tracked (connect point, service).
    pub fn connect_point_status(&self) -> Vec<views::ServiceStatus> {
        self.status
            .entries()
            .into_iter()
            .map(|(key, status)| views::ServiceStatus::new(&key, status))
            .collect()
    }

    /// Every connected device the subscriber service knows as an OLT.
    pub fn fetch_olts(&self) -> Vec<DeviceId> {
        self.inventory
            .devices()
            .into_iter()
            .filter(|d| self.olt_info(d).is_some())
            .map(|d| d.id)
            .collect()
    }

    /// Locate a subscriber's connect point by its id (the UNI port name).
    fn find_connect_point(&self, id: &str) -> OltResult<ConnectPoint> {
        for device in self.inventory.devices() {
            for port in self.inventory.ports(&device.id) {
                if port.name == id {
                    return Ok(ConnectPoint::new(device.id, port.number));
                }
            }
        }
        warn!(self.log, "connect point not found"; "subscriber" => id);
        Err(OltError::NotConfigured(format!(
            "no connect point for subscriber {id}"
        )))
    }

    fn find_tag(
        &self,
        cp: &ConnectPoint,
        c_tag: VlanId,
        s_tag: VlanId,
        tp_id: i32,
    ) -> Option<UniTagInformation> {
        let port = self.inventory.port(cp)?;
        let sub = self.subscribers.subscriber(&port.name)?;
        sub.uni_tag_list
            .into_iter()
            .find(|t| t.triple() == (c_tag, s_tag, tp_id))
    }
}
