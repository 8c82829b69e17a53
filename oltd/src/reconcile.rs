// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The reconciliation state machine.
//!
//! Everything the daemon does to a device funnels through one task type.
//! A task runs to completion or parks itself on a pending condition (a
//! meter that isn't confirmed, a MAC that isn't learned, a removal that
//! must finish first); whichever component completes the condition
//! re-submits the task.  Tasks are therefore written to be idempotent:
//! re-running one against the status store is always safe.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;

use common::network::MacAddr;
use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;
use sbi::CompletionContext;
use sbi::MeterId;
use sbi::ObjectiveVerb;

use crate::inventory::AccessDevice;
use crate::inventory::AccessPort;
use crate::inventory::NNI_PREFIX;
use crate::service::AccessDeviceEventKind;
use crate::status::AccessDevicePort;
use crate::status::OltFlowsStatus;
use crate::status::ServiceKey;
use crate::status::StatusUpdate;
use crate::subscriber::SubscriberInfo;
use crate::subscriber::UniTagInformation;
use crate::types::OltError;
use crate::types::OltResult;
use crate::Olt;

/// How a task run ended.  `Parked` means "not done": the task has been
/// queued on some pending condition and will run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Parked,
}

/// One unit of reconciliation work.  Serialisable so that parked tasks can
/// ride the replicated pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileTask {
    PortUp { device: DeviceId, port: PortNo },
    PortDown { device: DeviceId, port: PortNo },
    DeviceConnected { device: DeviceId },
    DeviceDisconnected { device: DeviceId },
    PurgeDevice { device: DeviceId },
    Provision { cp: ConnectPoint },
    Remove { cp: ConnectPoint },
    ProvisionService { cp: ConnectPoint, c_tag: VlanId, s_tag: VlanId, tp_id: i32 },
    RemoveService { cp: ConnectPoint, c_tag: VlanId, s_tag: VlanId, tp_id: i32 },
}

impl ReconcileTask {
    /// The device this task concerns; ownership filtering keys on it.
    pub fn device(&self) -> &DeviceId {
        match self {
            ReconcileTask::PortUp { device, .. }
            | ReconcileTask::PortDown { device, .. }
            | ReconcileTask::DeviceConnected { device }
            | ReconcileTask::DeviceDisconnected { device }
            | ReconcileTask::PurgeDevice { device } => device,
            ReconcileTask::Provision { cp }
            | ReconcileTask::Remove { cp }
            | ReconcileTask::ProvisionService { cp, .. }
            | ReconcileTask::RemoveService { cp, .. } => &cp.device,
        }
    }
}

impl fmt::Display for ReconcileTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileTask::PortUp { device, port } => {
                write!(f, "port-up {device}/{port}")
            }
            ReconcileTask::PortDown { device, port } => {
                write!(f, "port-down {device}/{port}")
            }
            ReconcileTask::DeviceConnected { device } => {
                write!(f, "device-connected {device}")
            }
            ReconcileTask::DeviceDisconnected { device } => {
                write!(f, "device-disconnected {device}")
            }
            ReconcileTask::PurgeDevice { device } => {
                write!(f, "purge-device {device}")
            }
            ReconcileTask::Provision { cp } => write!(f, "provision {cp}"),
            ReconcileTask::Remove { cp } => write!(f, "remove {cp}"),
            ReconcileTask::ProvisionService { cp, c_tag, s_tag, tp_id } => {
                write!(f, "provision-service {cp} c={c_tag} s={s_tag} tp={tp_id}")
            }
            ReconcileTask::RemoveService { cp, c_tag, s_tag, tp_id } => {
                write!(f, "remove-service {cp} c={c_tag} s={s_tag} tp={tp_id}")
            }
        }
    }
}

/// A task parked on MAC learning, stamped so over-age waiters can be
/// dropped.
pub struct MacWaiter {
    pub task: ReconcileTask,
    pub parked_at: DateTime<Utc>,
}

impl Olt {
    /// Run one reconciliation task to completion or to a parked state.
    pub fn reconcile(self: &Arc<Self>, task: ReconcileTask) -> TaskOutcome {
        let result = if !self.is_device_mine(task.device()) {
            Err(OltError::NotOwned(task.device().clone()))
        } else {
            match task.clone() {
                ReconcileTask::PortUp { device, port } => {
                    self.port_up(&device, port)
                }
                ReconcileTask::PortDown { device, port } => {
                    self.port_down(&device, port)
                }
                ReconcileTask::DeviceConnected { device } => {
                    self.device_connected(&device)
                }
                ReconcileTask::DeviceDisconnected { device } => {
                    self.device_disconnected(&device)
                }
                ReconcileTask::PurgeDevice { device } => {
                    self.purge_device(&device)
                }
                ReconcileTask::Provision { cp } => self.provision(&cp),
                ReconcileTask::Remove { cp } => self.remove(&cp),
                ReconcileTask::ProvisionService { cp, c_tag, s_tag, tp_id } => {
                    self.provision_service(&cp, c_tag, s_tag, tp_id)
                }
                ReconcileTask::RemoveService { cp, c_tag, s_tag, tp_id } => {
                    self.remove_service(&cp, c_tag, s_tag, tp_id)
                }
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(OltError::NotOwned(device)) => {
                debug!(self.log, "skipping task for foreign device";
                    "task" => %task, "device" => %device);
                TaskOutcome::Done
            }
            // transient conditions: the task is already parked on whatever
            // completes them
            Err(e @ OltError::MeterUnavailable { .. })
            | Err(e @ OltError::MacPending { .. }) => {
                debug!(self.log, "task parked"; "task" => %task,
                    "reason" => %e);
                TaskOutcome::Parked
            }
            Err(e) => {
                warn!(self.log, "reconciliation failed";
                    "task" => %task, "error" => %e);
                TaskOutcome::Done
            }
        }
    }

    /// Queue a task for the worker pool.
    pub fn submit(&self, task: ReconcileTask) {
        // the receiver lives as long as the daemon
        let _ = self.tasks.send(task);
    }

    // ---- subscriber-service helpers ------------------------------------

    /// The OLT-level record for a device, if the subscriber service knows
    /// the device at all.
    pub fn olt_info(&self, device: &AccessDevice) -> Option<SubscriberInfo> {
        self.subscribers.subscriber(&device.serial)
    }

    /// The configured uplink (NNI) port of the device.
    pub fn uplink_port(&self, device: &AccessDevice) -> Option<AccessPort> {
        let info = self.olt_info(device)?;
        let uplink = info.uplink_port?;
        self.inventory
            .ports(&device.id)
            .into_iter()
            .find(|p| p.number.as_u32() == uplink)
    }

    /// A port is a UNI unless it is the configured uplink - or, when the
    /// uplink is misconfigured, unless its name carries the NNI prefix.
    pub fn is_uni_port(&self, device: &AccessDevice, port: &AccessPort) -> bool {
        if let Some(uplink) = self.uplink_port(device) {
            return uplink.number != port.number;
        }
        if port.name.starts_with(NNI_PREFIX) {
            error!(self.log, "NNI port number not matching configured uplink";
                "device" => %device.id, "port" => %port.number);
            return false;
        }
        true
    }

    pub fn is_nni_port(&self, device_id: &DeviceId, port: PortNo) -> bool {
        let Some(device) = self.inventory.device(device_id) else {
            return false;
        };
        let cp = ConnectPoint::new(device_id.clone(), port);
        let Some(port) = self.inventory.port(&cp) else { return false };
        !self.is_uni_port(&device, &port)
    }

    fn subscriber_on(&self, port: &AccessPort) -> Option<SubscriberInfo> {
        self.subscribers.subscriber(&port.name)
    }

    fn find_uni_tag(
        &self,
        cp: &ConnectPoint,
        c_tag: VlanId,
        s_tag: VlanId,
        tp_id: i32,
    ) -> Option<UniTagInformation> {
        let port = self.inventory.port(cp)?;
        let sub = self.subscriber_on(&port)?;
        sub.uni_tag_list
            .into_iter()
            .find(|t| t.triple() == (c_tag, s_tag, tp_id))
    }

    fn tag_meter(&self, device: &DeviceId, bp: &Option<String>) -> Option<MeterId> {
        bp.as_deref().and_then(|bp| self.meters.meter_for(device, bp))
    }

    // ---- port events ---------------------------------------------------

    fn port_up(
        self: &Arc<Self>,
        device_id: &DeviceId,
        port_no: PortNo,
    ) -> OltResult<TaskOutcome> {
        let Some(device) = self.inventory.device(device_id) else {
            return Ok(TaskOutcome::Done);
        };
        let cp = ConnectPoint::new(device_id.clone(), port_no);
        let Some(port) = self.inventory.port(&cp) else {
            return Ok(TaskOutcome::Done);
        };
        if port.number.is_logical() {
            return Ok(TaskOutcome::Done);
        }
        if self.olt_info(&device).is_none() {
            warn!(self.log, "device is not a known OLT, ignoring port";
                "device" => %device_id, "port" => %port_no);
            return Ok(TaskOutcome::Done);
        }

        if self.is_uni_port(&device, &port) {
            self.post_port_event(
                AccessDeviceEventKind::UniAdded,
                device_id,
                port.number,
            );
            if !port.enabled || !self.config.enable_eapol {
                return Ok(TaskOutcome::Done);
            }
            if self.status.has_default_eapol(&cp) {
                return Ok(TaskOutcome::Done);
            }
            self.add_default_eapol(
                device_id,
                &port,
                ReconcileTask::PortUp { device: device_id.clone(), port: port_no },
            )
        } else {
            info!(self.log, "installing NNI trap suite";
                "device" => %device_id, "port" => %port_no);
            self.nni_traps(device_id, &port, ObjectiveVerb::Add)?;
            Ok(TaskOutcome::Done)
        }
    }

    fn port_down(
        self: &Arc<Self>,
        device_id: &DeviceId,
        port_no: PortNo,
    ) -> OltResult<TaskOutcome> {
        let cp = ConnectPoint::new(device_id.clone(), port_no);
        let entries = self.status.port_status(&cp);
        let device = self.inventory.device(device_id);
        let uplink = device.as_ref().and_then(|d| self.uplink_port(d));

        let mut was_uni = false;
        for (key, st) in entries {
            if key.is_default_eapol() {
                was_uni = true;
                if st.default_eapol.has_flow() {
                    self.remove_default_eapol(device_id, &key, None)?;
                }
                continue;
            }
            if key.is_nni() {
                if let Some(port) = self.inventory.port(&cp) {
                    self.nni_traps(device_id, &port, ObjectiveVerb::Remove)?;
                }
                continue;
            }
            was_uni = true;
            let tag = key.tag.clone();
            if st.subscriber_flows.has_flow() {
                if let Some(uplink) = &uplink {
                    self.remove_subscriber_flows(&cp, uplink.number, &key, &tag)?;
                } else {
                    warn!(self.log, "no uplink port, dropping dataplane state";
                        "device" => %device_id);
                    self.status.update(
                        &key,
                        StatusUpdate::subscriber_flows(OltFlowsStatus::Removed),
                    );
                }
            }
            if st.dhcp.has_flow() {
                self.status
                    .update(&key, StatusUpdate::dhcp(OltFlowsStatus::PendingRemove));
                let meter =
                    self.tag_meter(device_id, &tag.upstream_bandwidth_profile);
                self.emit_dhcp(
                    device_id,
                    port_no,
                    Some(&tag),
                    true,
                    meter,
                    ObjectiveVerb::Remove,
                    Some(key.clone()),
                )?;
            }
        }

        // provisioned-subscriber entries survive, so the port can be
        // re-provisioned when it comes back
        if was_uni {
            self.post_port_event(
                AccessDeviceEventKind::UniRemoved,
                device_id,
                port_no,
            );
        }
        Ok(TaskOutcome::Done)
    }

    // ---- device events -------------------------------------------------

    fn device_connected(
        self: &Arc<Self>,
        device_id: &DeviceId,
    ) -> OltResult<TaskOutcome> {
        let Some(device) = self.inventory.device(device_id) else {
            return Ok(TaskOutcome::Done);
        };
        self.post_device_event(
            AccessDeviceEventKind::DeviceConnected,
            device_id,
        );
        if self.olt_info(&device).is_none() {
            warn!(self.log, "connected device is not a known OLT";
                "device" => %device_id, "serial" => &device.serial);
            return Ok(TaskOutcome::Done);
        }

        for port in self.inventory.ports(device_id) {
            if port.number.is_logical() || !port.enabled {
                continue;
            }
            if self.is_uni_port(&device, &port) {
                self.post_port_event(
                    AccessDeviceEventKind::UniAdded,
                    device_id,
                    port.number,
                );
                let cp = ConnectPoint::new(device_id.clone(), port.number);
                if self.config.enable_eapol
                    && !self.status.has_default_eapol(&cp)
                {
                    // park per-port so a pending meter doesn't re-run the
                    // whole device sweep
                    self.add_default_eapol(
                        device_id,
                        &port,
                        ReconcileTask::PortUp {
                            device: device_id.clone(),
                            port: port.number,
                        },
                    )?;
                }
            } else {
                self.nni_traps(device_id, &port, ObjectiveVerb::Add)?;
            }
        }
        Ok(TaskOutcome::Done)
    }

    fn device_disconnected(
        self: &Arc<Self>,
        device_id: &DeviceId,
    ) -> OltResult<TaskOutcome> {
        let uni_ports: std::collections::BTreeSet<PortNo> = self
            .status
            .entries()
            .into_iter()
            .filter(|(k, _)| k.port.device == *device_id && !k.is_nni())
            .map(|(k, _)| k.port.number)
            .collect();

        self.purge_device(device_id)?;

        for port in uni_ports {
            self.post_port_event(
                AccessDeviceEventKind::UniRemoved,
                device_id,
                port,
            );
        }
        Ok(TaskOutcome::Done)
    }

    /// Bulk purge: the device's rules, its status and provisioned entries,
    /// and its meter bindings.
    fn purge_device(
        self: &Arc<Self>,
        device_id: &DeviceId,
    ) -> OltResult<TaskOutcome> {
        info!(self.log, "purging device"; "device" => %device_id);
        if let Err(e) = self.flows.purge_flows(device_id) {
            // the device is usually gone; its rules die with it
            warn!(self.log, "flow purge failed"; "device" => %device_id,
                "error" => %e);
        }
        self.status.purge_device(device_id);
        self.meters.clear(device_id);
        self.post_device_event(
            AccessDeviceEventKind::DeviceDisconnected,
            device_id,
        );
        Ok(TaskOutcome::Done)
    }

    // ---- subscriber provisioning ---------------------------------------

    fn provision(self: &Arc<Self>, cp: &ConnectPoint) -> OltResult<TaskOutcome> {
        let Some(port) = self.inventory.port(cp) else {
            warn!(self.log, "provisioning a vanished port"; "cp" => %cp);
            return Ok(TaskOutcome::Done);
        };
        let Some(sub) = self.subscriber_on(&port) else {
            return Err(OltError::NotConfigured(format!(
                "no subscriber for port {}",
                port.name
            )));
        };
        if sub.uni_tag_list.is_empty() {
            warn!(self.log, "subscriber has no services"; "id" => &sub.id);
            return Ok(TaskOutcome::Done);
        }
        let Some(device) = self.inventory.device(&cp.device) else {
            return Ok(TaskOutcome::Done);
        };
        let Some(uplink) = self.uplink_port(&device) else {
            return Err(OltError::NotConfigured(format!(
                "no uplink port on {}",
                cp.device
            )));
        };

        // Every meter first.  Parking on the slowest one and re-running is
        // cheaper than tracking per-meter continuations.
        let task = ReconcileTask::Provision { cp: cp.clone() };
        if !self.ensure_service_meters(&cp.device, &sub, &task)? {
            return Ok(TaskOutcome::Parked);
        }

        // The default trap and the tagged traps are mutually exclusive on
        // a UNI: take the default one down before anything else goes in.
        if self.config.enable_eapol && self.status.has_default_eapol(cp) {
            let key = ServiceKey::default_eapol(AccessDevicePort::new(
                &cp.device, &port,
            ));
            let wake = self
                .config
                .wait_for_removal
                .then(|| task.clone());
            self.remove_default_eapol(&cp.device, &key, wake)?;
            if self.config.wait_for_removal {
                debug!(self.log, "waiting for default eapol removal";
                    "cp" => %cp);
                return Ok(TaskOutcome::Parked);
            }
        }
        if self.config.wait_for_removal
            && self.status.is_default_eapol_pending_removal(cp)
        {
            // a removal from an earlier pass is still in flight; its
            // completion re-submits us
            return Ok(TaskOutcome::Parked);
        }

        for tag in &sub.uni_tag_list {
            self.provision_tag(cp, &port, uplink.number, tag)?;
        }
        Ok(TaskOutcome::Done)
    }

    fn provision_tag(
        self: &Arc<Self>,
        cp: &ConnectPoint,
        port: &AccessPort,
        uplink: PortNo,
        tag: &UniTagInformation,
    ) -> OltResult<()> {
        let key = ServiceKey::new(
            AccessDevicePort::new(&cp.device, port),
            tag.clone(),
        );

        // multicast delivery is programmed by the multicast controller;
        // the subscriber only gets registered
        if tag.service_name == self.config.multicast_service_name {
            self.status.set_provisioned(&key, true);
            self.post_subscriber_event(
                AccessDeviceEventKind::SubscriberUniTagRegistered,
                cp,
                tag,
            );
            return Ok(());
        }

        let us_meter =
            self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
        let ds_meter =
            self.tag_meter(&cp.device, &tag.downstream_bandwidth_profile);
        let olt_us =
            self.tag_meter(&cp.device, &tag.upstream_olt_bandwidth_profile);
        let olt_ds =
            self.tag_meter(&cp.device, &tag.downstream_olt_bandwidth_profile);

        if tag.is_dhcp_required && !self.status.has_dhcp_flows(cp, tag) {
            self.status
                .update(&key, StatusUpdate::dhcp(OltFlowsStatus::PendingAdd));
            self.emit_dhcp(
                &cp.device,
                port.number,
                Some(tag),
                true,
                us_meter,
                ObjectiveVerb::Add,
                Some(key.clone()),
            )?;
        }

        if tag.enable_mac_learning
            && tag.configured_mac().is_none()
            && self.learned_mac(cp, tag.pon_c_tag).is_none()
        {
            self.park_on_mac(
                cp.clone(),
                tag.pon_c_tag,
                ReconcileTask::Provision { cp: cp.clone() },
            );
            return Err(OltError::MacPending {
                cp: cp.clone(),
                vlan: tag.pon_c_tag,
            });
        }

        if !self.status.has_subscriber_flows(cp, tag) {
            let dst_mac = tag.configured_mac().or_else(|| {
                tag.enable_mac_learning
                    .then(|| self.learned_mac(cp, tag.pon_c_tag))
                    .flatten()
            });
            self.status.update(
                &key,
                StatusUpdate::subscriber_flows(OltFlowsStatus::PendingAdd),
            );

            let up = self.flow_builder.up_forward(
                uplink,
                port.number,
                tag,
                us_meter,
                olt_us,
                ObjectiveVerb::Add,
            );
            let down = self.flow_builder.down_forward(
                uplink,
                port.number,
                tag,
                ds_meter,
                olt_ds,
                dst_mac,
                ObjectiveVerb::Add,
            );
            let (up_ctx, down_ctx) = self.forward_pair_ctx(key.clone(), true);
            self.flows.forward(&cp.device, up, up_ctx)?;
            self.flows.forward(&cp.device, down, down_ctx)?;

            if self.config.enable_eapol {
                let eapol = self.flow_builder.eapol_trap(
                    port.number,
                    tag,
                    us_meter,
                    olt_us,
                    ObjectiveVerb::Add,
                );
                self.flows.filter(
                    &cp.device,
                    eapol,
                    CompletionContext::none(),
                )?;
            }
            if tag.is_igmp_required {
                let igmp = self.flow_builder.igmp_trap(
                    port.number,
                    true,
                    Some(tag),
                    us_meter,
                    ObjectiveVerb::Add,
                );
                self.flows.filter(
                    &cp.device,
                    igmp,
                    CompletionContext::none(),
                )?;
            }
        }

        self.status.set_provisioned(&key, true);
        Ok(())
    }

    fn remove(self: &Arc<Self>, cp: &ConnectPoint) -> OltResult<TaskOutcome> {
        let programmed = self.status.programmed_on(cp);
        if programmed.is_empty() {
            warn!(self.log, "subscriber was not programmed, nothing to remove";
                "cp" => %cp);
            return Ok(TaskOutcome::Done);
        }
        let Some(device) = self.inventory.device(&cp.device) else {
            return Ok(TaskOutcome::Done);
        };
        let Some(uplink) = self.uplink_port(&device) else {
            warn!(self.log, "no uplink port found"; "device" => %cp.device);
            return Ok(TaskOutcome::Done);
        };

        for key in programmed {
            let tag = key.tag.clone();
            if tag.service_name == self.config.multicast_service_name {
                self.status.set_provisioned(&key, false);
                self.post_subscriber_event(
                    AccessDeviceEventKind::SubscriberUniTagUnregistered,
                    cp,
                    &tag,
                );
                continue;
            }
            self.remove_subscriber_flows(cp, uplink.number, &key, &tag)?;
            self.status.set_provisioned(&key, false);
            if tag.is_dhcp_required {
                self.status.update(
                    &key,
                    StatusUpdate::dhcp(OltFlowsStatus::PendingRemove),
                );
                let meter =
                    self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
                self.emit_dhcp(
                    &cp.device,
                    cp.port,
                    Some(&tag),
                    true,
                    meter,
                    ObjectiveVerb::Remove,
                    Some(key.clone()),
                )?;
            }
            if tag.is_igmp_required {
                let meter =
                    self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
                let igmp = self.flow_builder.igmp_trap(
                    cp.port,
                    true,
                    Some(&tag),
                    meter,
                    ObjectiveVerb::Remove,
                );
                self.flows.filter(&cp.device, igmp, CompletionContext::none())?;
            }
        }

        // an enabled port reverts to the authentication trap
        if let Some(port) = self.inventory.port(cp) {
            if port.enabled
                && self.config.enable_eapol
                && !self.status.has_default_eapol(cp)
            {
                return self.add_default_eapol(
                    &cp.device,
                    &port,
                    ReconcileTask::PortUp {
                        device: cp.device.clone(),
                        port: cp.port,
                    },
                );
            }
        } else {
            debug!(self.log, "port gone, not reinstalling default eapol";
                "cp" => %cp);
        }
        Ok(TaskOutcome::Done)
    }

    /// Remove the tagged EAPOL trap and the data-plane pair of one service.
    fn remove_subscriber_flows(
        self: &Arc<Self>,
        cp: &ConnectPoint,
        uplink: PortNo,
        key: &ServiceKey,
        tag: &UniTagInformation,
    ) -> OltResult<()> {
        let us_meter =
            self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
        let ds_meter =
            self.tag_meter(&cp.device, &tag.downstream_bandwidth_profile);
        let olt_us =
            self.tag_meter(&cp.device, &tag.upstream_olt_bandwidth_profile);
        let olt_ds =
            self.tag_meter(&cp.device, &tag.downstream_olt_bandwidth_profile);

        if self.config.enable_eapol {
            let eapol = self.flow_builder.eapol_trap(
                key.port.number,
                tag,
                us_meter,
                olt_us,
                ObjectiveVerb::Remove,
            );
            self.flows.filter(&cp.device, eapol, CompletionContext::none())?;
        }

        self.status.update(
            key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::PendingRemove),
        );

        let up = self.flow_builder.up_forward(
            uplink,
            key.port.number,
            tag,
            us_meter,
            olt_us,
            ObjectiveVerb::Remove,
        );
        let down = self.flow_builder.down_forward(
            uplink,
            key.port.number,
            tag,
            ds_meter,
            olt_ds,
            tag.configured_mac(),
            ObjectiveVerb::Remove,
        );
        let (up_ctx, down_ctx) = self.forward_pair_ctx(key.clone(), false);
        self.flows.forward(&cp.device, up, up_ctx)?;
        self.flows.forward(&cp.device, down, down_ctx)?;
        Ok(())
    }

    // ---- single-service (transparent) provisioning ---------------------

    fn provision_service(
        self: &Arc<Self>,
        cp: &ConnectPoint,
        c_tag: VlanId,
        s_tag: VlanId,
        tp_id: i32,
    ) -> OltResult<TaskOutcome> {
        let Some(port) = self.inventory.port(cp) else {
            return Err(OltError::BadRequest(format!(
                "invalid connect point {cp}"
            )));
        };
        let Some(tag) = self.find_uni_tag(cp, c_tag, s_tag, tp_id) else {
            return Err(OltError::BadRequest(format!(
                "no service with ponCtag {c_tag} ponStag {s_tag} tpId {tp_id}"
            )));
        };
        let Some(device) = self.inventory.device(&cp.device) else {
            return Ok(TaskOutcome::Done);
        };
        let Some(uplink) = self.uplink_port(&device) else {
            return Err(OltError::NotConfigured(format!(
                "no uplink port on {}",
                cp.device
            )));
        };

        let task = ReconcileTask::ProvisionService {
            cp: cp.clone(),
            c_tag,
            s_tag,
            tp_id,
        };
        let mut ready = true;
        for bp in tag.bandwidth_profiles() {
            ready &= self.ensure_or_park(&cp.device, bp, &task)?;
        }
        if !ready {
            return Ok(TaskOutcome::Parked);
        }

        let key = ServiceKey::new(
            AccessDevicePort::new(&cp.device, &port),
            tag.clone(),
        );
        let us_meter =
            self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
        let ds_meter =
            self.tag_meter(&cp.device, &tag.downstream_bandwidth_profile);

        self.status.update(
            &key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::PendingAdd),
        );
        let up = self.flow_builder.transparent_forward(
            uplink.number,
            cp.port,
            &tag,
            us_meter,
            true,
            ObjectiveVerb::Add,
        );
        let down = self.flow_builder.transparent_forward(
            uplink.number,
            cp.port,
            &tag,
            ds_meter,
            false,
            ObjectiveVerb::Add,
        );
        let (up_ctx, down_ctx) = self.forward_pair_ctx(key.clone(), true);
        self.flows.forward(&cp.device, up, up_ctx)?;
        self.flows.forward(&cp.device, down, down_ctx)?;
        self.status.set_provisioned(&key, true);
        Ok(TaskOutcome::Done)
    }

    fn remove_service(
        self: &Arc<Self>,
        cp: &ConnectPoint,
        c_tag: VlanId,
        s_tag: VlanId,
        tp_id: i32,
    ) -> OltResult<TaskOutcome> {
        let Some(tag) = self.find_uni_tag(cp, c_tag, s_tag, tp_id) else {
            warn!(self.log, "no matching service, nothing to remove";
                "cp" => %cp, "ctag" => %c_tag, "stag" => %s_tag);
            return Ok(TaskOutcome::Done);
        };
        let Some(device) = self.inventory.device(&cp.device) else {
            return Ok(TaskOutcome::Done);
        };
        let Some(uplink) = self.uplink_port(&device) else {
            warn!(self.log, "no uplink port found"; "device" => %cp.device);
            return Ok(TaskOutcome::Done);
        };
        let Some(port) = self.inventory.port(cp) else {
            return Ok(TaskOutcome::Done);
        };

        let key = ServiceKey::new(
            AccessDevicePort::new(&cp.device, &port),
            tag.clone(),
        );
        let us_meter =
            self.tag_meter(&cp.device, &tag.upstream_bandwidth_profile);
        let ds_meter =
            self.tag_meter(&cp.device, &tag.downstream_bandwidth_profile);

        self.status.update(
            &key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::PendingRemove),
        );
        self.status.set_provisioned(&key, false);
        let up = self.flow_builder.transparent_forward(
            uplink.number,
            cp.port,
            &tag,
            us_meter,
            true,
            ObjectiveVerb::Remove,
        );
        let down = self.flow_builder.transparent_forward(
            uplink.number,
            cp.port,
            &tag,
            ds_meter,
            false,
            ObjectiveVerb::Remove,
        );
        let (up_ctx, down_ctx) = self.forward_pair_ctx(key.clone(), false);
        self.flows.forward(&cp.device, up, up_ctx)?;
        self.flows.forward(&cp.device, down, down_ctx)?;
        Ok(TaskOutcome::Done)
    }

    // ---- shared emission helpers ---------------------------------------

    /// Ensure every meter the subscriber's services need.  Returns false
    /// (after parking the task) when at least one install is still in
    /// flight.
    fn ensure_service_meters(
        &self,
        device: &DeviceId,
        sub: &SubscriberInfo,
        task: &ReconcileTask,
    ) -> OltResult<bool> {
        let mut ready = true;
        for tag in &sub.uni_tag_list {
            if tag.service_name == self.config.multicast_service_name {
                continue;
            }
            for bp in tag.bandwidth_profiles() {
                ready &= self.ensure_or_park(device, bp, task)?;
            }
        }
        Ok(ready)
    }

    /// Ensure one meter, parking the task when its install is still in
    /// flight.  Returns whether the meter is usable.
    fn ensure_or_park(
        &self,
        device: &DeviceId,
        bp: &str,
        task: &ReconcileTask,
    ) -> OltResult<bool> {
        match self.meters.ensure_meter(device, bp) {
            Ok((_, true)) => Ok(true),
            Ok((_, false)) => {
                self.meters.park(device, task.clone());
                Ok(false)
            }
            Err(OltError::MeterUnavailable { device: d, .. }) => {
                self.meters.park(&d, task.clone());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn add_default_eapol(
        self: &Arc<Self>,
        device: &DeviceId,
        port: &AccessPort,
        park_task: ReconcileTask,
    ) -> OltResult<TaskOutcome> {
        let bp = self.config.default_bp_id.clone();
        if !self.ensure_or_park(device, &bp, &park_task)? {
            return Ok(TaskOutcome::Parked);
        }
        let meter = self.meters.meter_for(device, &bp);

        let key =
            ServiceKey::default_eapol(AccessDevicePort::new(device, port));
        self.status.update(
            &key,
            StatusUpdate::default_eapol(OltFlowsStatus::PendingAdd),
        );
        info!(self.log, "installing default eapol trap";
            "device" => %device, "port" => %port.number);
        let obj = self.flow_builder.default_eapol_trap(
            port.number,
            meter,
            ObjectiveVerb::Add,
        );
        let ctx = self.default_eapol_ctx(key, None);
        self.flows.filter(device, obj, ctx)?;
        Ok(TaskOutcome::Done)
    }

    fn remove_default_eapol(
        self: &Arc<Self>,
        device: &DeviceId,
        key: &ServiceKey,
        wake: Option<ReconcileTask>,
    ) -> OltResult<()> {
        let meter = self.meters.meter_for(device, &self.config.default_bp_id);
        if meter.is_none() {
            // removal only needs the match; proceed without the meter
            warn!(self.log, "removing default eapol with unknown meter";
                "device" => %device);
        }
        self.status.update(
            key,
            StatusUpdate::default_eapol(OltFlowsStatus::PendingRemove),
        );
        let obj = self.flow_builder.default_eapol_trap(
            key.port.number,
            meter,
            ObjectiveVerb::Remove,
        );
        let ctx = self.default_eapol_ctx(key.clone(), wake);
        self.flows.filter(device, obj, ctx)?;
        Ok(())
    }

    fn default_eapol_ctx(
        self: &Arc<Self>,
        key: ServiceKey,
        wake: Option<ReconcileTask>,
    ) -> CompletionContext {
        let olt = Arc::clone(self);
        CompletionContext::on_complete(move |result| match result {
            Ok(()) => {
                if let Some(task) = wake {
                    olt.submit(task);
                }
            }
            Err(e) => {
                let e = OltError::Southbound(e);
                error!(olt.log, "default eapol directive failed";
                    "key" => %key, "error" => %e);
                olt.status.update(
                    &key,
                    StatusUpdate::default_eapol(OltFlowsStatus::Error),
                );
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_dhcp(
        self: &Arc<Self>,
        device: &DeviceId,
        port: PortNo,
        tag: Option<&UniTagInformation>,
        upstream: bool,
        meter: Option<MeterId>,
        verb: ObjectiveVerb,
        key: Option<ServiceKey>,
    ) -> OltResult<()> {
        if self.config.enable_dhcp_v4 {
            let obj = self
                .flow_builder
                .dhcp_trap(port, true, upstream, tag, meter, verb);
            self.flows.filter(device, obj, self.dhcp_ctx(key.clone()))?;
        }
        if self.config.enable_dhcp_v6 {
            let obj = self
                .flow_builder
                .dhcp_trap(port, false, upstream, tag, meter, verb);
            self.flows.filter(device, obj, self.dhcp_ctx(key))?;
        }
        Ok(())
    }

    fn dhcp_ctx(
        self: &Arc<Self>,
        key: Option<ServiceKey>,
    ) -> CompletionContext {
        let Some(key) = key else { return CompletionContext::none() };
        let olt = Arc::clone(self);
        CompletionContext::on_complete(move |result| {
            if let Err(e) = result {
                let e = OltError::Southbound(e);
                error!(olt.log, "dhcp directive failed";
                    "key" => %key, "error" => %e);
                olt.status
                    .update(&key, StatusUpdate::dhcp(OltFlowsStatus::Error));
            }
        })
    }

    /// Completion pair for an up/down forward couple: the event fires when
    /// both succeed; any failure marks the service errored.
    fn forward_pair_ctx(
        self: &Arc<Self>,
        key: ServiceKey,
        adding: bool,
    ) -> (CompletionContext, CompletionContext) {
        let remaining = Arc::new(AtomicUsize::new(2));
        let failed = Arc::new(AtomicBool::new(false));

        let make = |olt: Arc<Olt>,
                    key: ServiceKey,
                    remaining: Arc<AtomicUsize>,
                    failed: Arc<AtomicBool>| {
            CompletionContext::on_complete(move |result| {
                if let Err(e) = result {
                    failed.store(true, Ordering::SeqCst);
                    let e = OltError::Southbound(e);
                    error!(olt.log, "dataplane directive failed";
                        "key" => %key, "error" => %e);
                    olt.status.update(
                        &key,
                        StatusUpdate::subscriber_flows(OltFlowsStatus::Error),
                    );
                    olt.post_subscriber_event(
                        if adding {
                            AccessDeviceEventKind::SubscriberUniTagRegistrationFailed
                        } else {
                            AccessDeviceEventKind::SubscriberUniTagUnregistrationFailed
                        },
                        &key.port.connect_point(),
                        &key.tag,
                    );
                    return;
                }
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1
                    && !failed.load(Ordering::SeqCst)
                {
                    olt.post_subscriber_event(
                        if adding {
                            AccessDeviceEventKind::SubscriberUniTagRegistered
                        } else {
                            AccessDeviceEventKind::SubscriberUniTagUnregistered
                        },
                        &key.port.connect_point(),
                        &key.tag,
                    );
                }
            })
        };

        (
            make(
                Arc::clone(self),
                key.clone(),
                Arc::clone(&remaining),
                Arc::clone(&failed),
            ),
            make(Arc::clone(self), key, remaining, failed),
        )
    }

    fn nni_traps(
        &self,
        device: &DeviceId,
        port: &AccessPort,
        verb: ObjectiveVerb,
    ) -> OltResult<()> {
        let b = &self.flow_builder;
        self.flows.filter(
            device,
            b.lldp_trap(port.number, verb),
            CompletionContext::none(),
        )?;
        if self.config.enable_dhcp_on_nni {
            if self.config.enable_dhcp_v4 {
                self.flows.filter(
                    device,
                    b.dhcp_trap(port.number, true, false, None, None, verb),
                    CompletionContext::none(),
                )?;
            }
            if self.config.enable_dhcp_v6 {
                self.flows.filter(
                    device,
                    b.dhcp_trap(port.number, false, false, None, None, verb),
                    CompletionContext::none(),
                )?;
            }
        }
        if self.config.enable_igmp_on_nni {
            self.flows.filter(
                device,
                b.igmp_trap(port.number, false, None, None, verb),
                CompletionContext::none(),
            )?;
        }
        if self.config.enable_pppoe {
            self.flows.filter(
                device,
                b.pppoed_trap(port.number, false, None, None, verb),
                CompletionContext::none(),
            )?;
        }
        Ok(())
    }

    // ---- MAC learning --------------------------------------------------

    fn learned_mac(&self, cp: &ConnectPoint, vlan: VlanId) -> Option<MacAddr> {
        self.inventory
            .connected_hosts(cp)
            .into_iter()
            .find(|h| h.vlan == vlan)
            .map(|h| h.mac)
    }

    fn park_on_mac(&self, cp: ConnectPoint, vlan: VlanId, task: ReconcileTask) {
        info!(self.log, "parking until a host is learned";
            "cp" => %cp, "vlan" => %vlan, "task" => %task);
        self.mac_waiters
            .lock()
            .unwrap()
            .entry((cp, vlan))
            .or_default()
            .push(MacWaiter { task, parked_at: Utc::now() });
    }

    /// A host was discovered on (connect point, vlan): resume the tasks
    /// parked on it.
    pub fn host_discovered(&self, cp: &ConnectPoint, vlan: VlanId) {
        let waiters = self
            .mac_waiters
            .lock()
            .unwrap()
            .remove(&(cp.clone(), vlan));
        if let Some(waiters) = waiters {
            for w in waiters {
                self.submit(w.task);
            }
        }
    }

    /// Drop tasks that have been waiting on MAC learning longer than the
    /// configured cap.
    pub fn prune_mac_waiters(&self) {
        let cap = self.config.mac_learning_timeout_secs;
        if cap == 0 {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(cap as i64);
        let mut waiters = self.mac_waiters.lock().unwrap();
        for ((cp, vlan), queue) in waiters.iter_mut() {
            let before = queue.len();
            queue.retain(|w| w.parked_at > cutoff);
            if queue.len() < before {
                warn!(self.log, "dropped {} tasks waiting on MAC learning",
                    before - queue.len();
                    "cp" => %cp, "vlan" => %vlan);
            }
        }
        waiters.retain(|_, q| !q.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterEvent;
    use crate::cluster::NodeId;
    use crate::events::DeviceEvent;
    use crate::events::DeviceEventKind;
    use crate::flow::EAPOL_DEFAULT_VLAN;
    use crate::flow::MAX_PRIORITY;
    use crate::inventory::AccessPort;
    use crate::inventory::HostInfo;
    use crate::service::AccessDeviceEventKind;
    use crate::sharding::ConsistentHasher;
    use crate::sharding::HASH_WEIGHT;
    use crate::testutil::hsia_tag;
    use crate::testutil::Harness;
    use crate::testutil::TestCluster;
    use sbi::EthType;
    use sbi::FlowRule;
    use sbi::Instruction;

    fn is_default_eapol(r: &FlowRule) -> bool {
        r.selector.eth_type() == Some(EthType::Eapol)
            && r.treatment.set_vlans().contains(&EAPOL_DEFAULT_VLAN)
    }

    fn is_tagged_eapol(r: &FlowRule, vlan: u16) -> bool {
        r.selector.eth_type() == Some(EthType::Eapol)
            && r.treatment
                .set_vlans()
                .contains(&VlanId::new(vlan).unwrap())
    }

    fn is_dhcp_with_src(r: &FlowRule, udp_src: u16) -> bool {
        r.selector.udp_src() == Some(udp_src)
    }

    fn is_forward(r: &FlowRule, in_port: u32, out_port: u32) -> bool {
        r.selector.eth_type().is_none()
            && r.selector.in_port() == Some(PortNo::new(in_port))
            && r.treatment.output() == Some(PortNo::new(out_port))
    }

    fn port_up(h: &mut Harness, device: &DeviceId, port: u32) {
        h.run(ReconcileTask::PortUp {
            device: device.clone(),
            port: PortNo::new(port),
        });
        h.settle();
    }

    // Port 16 comes up on a fresh OLT: exactly one directive, the default
    // EAPOL trap, metered by the default profile and tagged 4091.
    #[test]
    fn test_uni_port_up_installs_default_eapol() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");

        // the default meter is unconfirmed, so the first pass parks
        let outcome = h.run(ReconcileTask::PortUp {
            device: dev.clone(),
            port: PortNo::new(16),
        });
        assert_eq!(outcome, TaskOutcome::Parked);
        assert_eq!(h.driver.rule_count(&dev), 0);

        // the meter confirmation re-wakes the parked task
        h.settle();
        let rules = h.driver.rules(&dev);
        assert_eq!(rules.len(), 1);
        let r = &rules[0];
        assert!(is_default_eapol(r));
        assert_eq!(r.selector.in_port(), Some(PortNo::new(16)));
        assert_eq!(r.priority, MAX_PRIORITY);
        assert!(r
            .treatment
            .instructions()
            .contains(&Instruction::WriteMetadata(64u64 << 32)));
        assert_eq!(r.treatment.output(), Some(PortNo::CONTROLLER));

        assert!(h.olt.status.has_default_eapol(&cp));
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| e.kind == AccessDeviceEventKind::UniAdded));
    }

    // With authentication disabled, a UNI coming up programs nothing.
    #[test]
    fn test_uni_port_up_without_eapol_is_bare() {
        let mut config = crate::config::Config::default();
        config.enable_eapol = false;
        let mut h = Harness::with_config(config);
        let dev = h.add_olt("of:01", "OLT-001", 2);
        h.add_uni(&dev, 16, "BBSM0001-1");

        port_up(&mut h, &dev, 16);
        assert_eq!(h.driver.rule_count(&dev), 0);
    }

    // The NNI comes up: LLDP and downstream DHCPv4 traps, nothing else
    // with the default knobs.
    #[test]
    fn test_nni_port_up_installs_trap_suite() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);

        port_up(&mut h, &dev, 2);

        let rules = h.driver.rules(&dev);
        assert_eq!(rules.len(), 2);
        assert!(rules
            .iter()
            .any(|r| r.selector.eth_type() == Some(EthType::Lldp)));
        let dhcp = rules
            .iter()
            .find(|r| is_dhcp_with_src(r, 67))
            .expect("downstream DHCPv4 trap");
        assert_eq!(dhcp.selector.in_port(), Some(PortNo::new(2)));
        // no vlan rewrite on NNI traps
        assert!(dhcp.treatment.set_vlans().is_empty());
    }

    fn provisioned_harness() -> (Harness, DeviceId, ConnectPoint) {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");
        h.add_hsia_subscriber("BBSM0001-1");
        port_up(&mut h, &dev, 16);
        h.olt.provision_subscriber(&cp).unwrap();
        h.settle();
        (h, dev, cp)
    }

    // Full provisioning: default EAPOL out; DHCP trap, both forwards and
    // the tagged EAPOL in; meters for both profiles.
    #[test]
    fn test_full_subscriber_provisioning() {
        let (mut h, dev, cp) = provisioned_harness();

        let rules = h.driver.rules(&dev);
        assert!(!rules.iter().any(is_default_eapol));
        assert!(rules.iter().any(|r| is_tagged_eapol(r, 101)));

        let dhcp = rules
            .iter()
            .find(|r| is_dhcp_with_src(r, 68))
            .expect("upstream DHCPv4 trap");
        assert!(dhcp
            .treatment
            .instructions()
            .contains(&Instruction::SetVlan(VlanId::new(101).unwrap())));

        let up = rules
            .iter()
            .find(|r| is_forward(r, 16, 2))
            .expect("upstream forward");
        assert_eq!(up.selector.vlan(), Some(VlanId::ANY));
        assert_eq!(
            up.treatment.set_vlans(),
            vec![VlanId::new(101).unwrap(), VlanId::new(7).unwrap()]
        );

        let down = rules
            .iter()
            .find(|r| is_forward(r, 2, 16))
            .expect("downstream forward");
        assert_eq!(down.selector.vlan(), Some(VlanId::new(7).unwrap()));
        assert_eq!(
            down.selector.inner_vlan(),
            Some(VlanId::new(101).unwrap())
        );
        assert_eq!(down.treatment.instructions()[0], Instruction::PopVlan);

        assert_eq!(rules.len(), 4);
        // Default + HSIA-US + HSIA-DS
        assert_eq!(h.olt.meters.meter_count(&dev), 3);

        let tag = hsia_tag();
        assert!(h.olt.status.has_subscriber_flows(&cp, &tag));
        assert!(h.olt.status.has_dhcp_flows(&cp, &tag));
        assert_eq!(h.olt.programmed_subscribers().len(), 1);
        assert!(h.drain_events().iter().any(
            |e| e.kind == AccessDeviceEventKind::SubscriberUniTagRegistered
        ));
    }

    // A provisioning request that beats the meter confirmation parks
    // without emitting any dataplane directive, and resumes to the full
    // set once the meters land.
    #[test]
    fn test_provisioning_waits_for_meters() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");
        h.add_hsia_subscriber("BBSM0001-1");
        port_up(&mut h, &dev, 16);

        h.olt.provision_subscriber(&cp).unwrap();
        let task = h.task_rx.try_recv().unwrap();
        assert_eq!(h.run(task), TaskOutcome::Parked);

        // meters were requested, but nothing referencing them went out
        assert_eq!(h.driver.meter_count(&dev), 3);
        let rules = h.driver.rules(&dev);
        assert_eq!(rules.len(), 1);
        assert!(is_default_eapol(&rules[0]));

        // meter confirmations resume the parked task
        h.settle();
        assert_eq!(h.driver.rules(&dev).len(), 4);
    }

    // Directives only ever reference confirmed meters.
    #[test]
    fn test_emitted_meters_are_installed() {
        let (h, dev, _) = provisioned_harness();
        for rule in h.driver.rules(&dev) {
            for meter in rule.treatment.meters() {
                assert!(
                    h.olt.meters.is_installed(&dev, meter),
                    "rule references unconfirmed {meter}"
                );
            }
        }
    }

    // Re-provisioning an already-programmed subscriber emits nothing new.
    #[test]
    fn test_provisioning_is_idempotent() {
        let (mut h, dev, cp) = provisioned_harness();
        let before = h.driver.rules(&dev);

        h.olt.provision_subscriber(&cp).unwrap();
        h.settle();

        assert_eq!(h.driver.rules(&dev), before);
        assert_eq!(h.olt.programmed_subscribers().len(), 1);
    }

    // Port down removes everything that was installed but keeps the
    // operator's intent; the port coming back gets its default trap again.
    #[test]
    fn test_port_down_keeps_intent_and_restores_trap() {
        let (mut h, dev, cp) = provisioned_harness();

        h.inventory.set_port(
            &dev,
            AccessPort {
                number: PortNo::new(16),
                name: "BBSM0001-1".to_string(),
                enabled: false,
            },
        );
        h.run(ReconcileTask::PortDown {
            device: dev.clone(),
            port: PortNo::new(16),
        });
        h.settle();

        assert_eq!(h.driver.rule_count(&dev), 0);
        assert_eq!(h.olt.status.port_status(&cp).len(), 0);
        // intent survives the outage
        assert_eq!(h.olt.programmed_subscribers().len(), 1);

        h.inventory.set_port(
            &dev,
            AccessPort {
                number: PortNo::new(16),
                name: "BBSM0001-1".to_string(),
                enabled: true,
            },
        );
        port_up(&mut h, &dev, 16);
        let rules = h.driver.rules(&dev);
        assert_eq!(rules.len(), 1);
        assert!(is_default_eapol(&rules[0]));
    }

    // provision + remove ends exactly where port-up started: the default
    // EAPOL trap and nothing else.
    #[test]
    fn test_remove_restores_port_up_state() {
        let (mut h, dev, cp) = provisioned_harness();

        h.olt.remove_subscriber(&cp).unwrap();
        h.settle();

        let rules = h.driver.rules(&dev);
        assert_eq!(rules.len(), 1);
        assert!(is_default_eapol(&rules[0]));
        assert_eq!(h.olt.programmed_subscribers().len(), 0);
        assert!(h.drain_events().iter().any(
            |e| e.kind == AccessDeviceEventKind::SubscriberUniTagUnregistered
        ));
    }

    #[test]
    fn test_remove_unprogrammed_subscriber_succeeds() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");

        assert!(h.olt.remove_subscriber(&cp).is_ok());
        h.settle();
        assert_eq!(h.driver.rule_count(&dev), 0);
    }

    // Device disconnection purges rules, statuses, provisioned entries and
    // meter bindings.
    #[test]
    fn test_device_disconnect_purges_everything() {
        let (mut h, dev, _) = provisioned_harness();
        h.drain_events();

        h.run(ReconcileTask::DeviceDisconnected { device: dev.clone() });
        h.settle();

        assert_eq!(h.driver.rule_count(&dev), 0);
        assert_eq!(h.olt.status.entries().len(), 0);
        assert_eq!(h.olt.programmed_subscribers().len(), 0);
        assert_eq!(h.olt.meters.meter_count(&dev), 0);

        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| e.kind == AccessDeviceEventKind::DeviceDisconnected));
        assert!(events
            .iter()
            .any(|e| e.kind == AccessDeviceEventKind::UniRemoved));
    }

    // The multicast service registers the subscriber but programs no
    // dataplane of its own.
    #[test]
    fn test_multicast_service_gets_no_dataplane() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");
        let mut tag = hsia_tag();
        tag.service_name = "multicastServiceName".to_string();
        tag.upstream_bandwidth_profile = None;
        tag.downstream_bandwidth_profile = None;
        h.subscribers.insert_subscriber(crate::subscriber::SubscriberInfo {
            id: "BBSM0001-1".to_string(),
            uplink_port: None,
            uni_tag_list: vec![tag],
        });
        port_up(&mut h, &dev, 16);

        h.olt.provision_subscriber(&cp).unwrap();
        h.settle();

        assert!(!h
            .driver
            .rules(&dev)
            .iter()
            .any(|r| is_forward(r, 16, 2) || is_forward(r, 2, 16)));
        assert_eq!(h.olt.programmed_subscribers().len(), 1);
        assert!(h.drain_events().iter().any(
            |e| e.kind == AccessDeviceEventKind::SubscriberUniTagRegistered
        ));
    }

    // Tag-specific provisioning installs only the transparent pair.
    #[test]
    fn test_tag_specific_provisioning_is_transparent() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        h.add_uni(&dev, 16, "BBSM0001-1");
        h.add_hsia_subscriber("BBSM0001-1");
        port_up(&mut h, &dev, 16);

        h.olt
            .provision_subscriber_by_id(
                "BBSM0001-1",
                Some(VlanId::new(7).unwrap()),
                Some(VlanId::new(101).unwrap()),
                Some(64),
            )
            .unwrap();
        h.settle();

        let rules = h.driver.rules(&dev);
        // default eapol stays; the pair rides beside it
        assert_eq!(rules.len(), 3);
        let up = rules
            .iter()
            .find(|r| is_forward(r, 16, 2))
            .expect("transparent upstream");
        assert_eq!(up.selector.inner_vlan(), Some(VlanId::new(101).unwrap()));
        assert!(rules.iter().any(|r| is_forward(r, 2, 16)));
        assert_eq!(h.olt.programmed_subscribers().len(), 1);
    }

    #[test]
    fn test_malformed_tag_selector_is_rejected() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        h.add_uni(&dev, 16, "BBSM0001-1");
        h.add_hsia_subscriber("BBSM0001-1");

        // a cTag without an sTag is malformed
        let err = h
            .olt
            .provision_subscriber_by_id(
                "BBSM0001-1",
                None,
                Some(VlanId::new(101).unwrap()),
                Some(64),
            )
            .unwrap_err();
        assert!(matches!(err, OltError::BadRequest(_)));

        // an unknown triple is rejected synchronously, too
        let err = h
            .olt
            .provision_subscriber_by_id(
                "BBSM0001-1",
                Some(VlanId::new(9).unwrap()),
                Some(VlanId::new(101).unwrap()),
                Some(64),
            )
            .unwrap_err();
        assert!(matches!(err, OltError::BadRequest(_)));
    }

    // MAC learning: the task parks until a host shows up on the service's
    // C tag, then the downstream forward matches the learned MAC.
    #[test]
    fn test_mac_learning_parks_until_host_appears() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        let cp = h.add_uni(&dev, 16, "BBSM0001-1");
        let mut tag = hsia_tag();
        tag.enable_mac_learning = true;
        h.subscribers.insert_subscriber(crate::subscriber::SubscriberInfo {
            id: "BBSM0001-1".to_string(),
            uplink_port: None,
            uni_tag_list: vec![tag],
        });
        h.subscribers.insert_profile(crate::testutil::profile("HSIA-US"));
        h.subscribers.insert_profile(crate::testutil::profile("HSIA-DS"));
        port_up(&mut h, &dev, 16);

        h.olt.provision_subscriber(&cp).unwrap();
        h.settle();
        // parked: no forwards yet
        assert!(!h.driver.rules(&dev).iter().any(|r| is_forward(r, 16, 2)));

        let mac: MacAddr = "0a:00:00:00:00:01".parse().unwrap();
        h.inventory.learn_host(
            cp.clone(),
            HostInfo { mac, vlan: VlanId::new(101).unwrap() },
        );
        h.olt.host_discovered(&cp, VlanId::new(101).unwrap());
        h.settle();

        let rules = h.driver.rules(&dev);
        let down = rules
            .iter()
            .find(|r| is_forward(r, 2, 16))
            .expect("downstream forward after host discovery");
        assert!(down
            .selector
            .criteria()
            .contains(&sbi::Criterion::EthDst(mac)));
    }

    // Ownership: an instance that doesn't own the device queues no work
    // for its events, until membership changes hand it the device.
    #[test]
    fn test_foreign_device_events_are_dropped() {
        let probe = ConsistentHasher::new(
            &[NodeId::new("n1"), NodeId::new("n2")],
            HASH_WEIGHT,
        );
        // a device the ring assigns to n1
        let foreign = (0..)
            .map(|i| format!("of:{i:016x}"))
            .find(|k| probe.hash(k) == Some(&NodeId::new("n1")))
            .unwrap();

        let mut h =
            Harness::with_cluster(TestCluster::new("n2", &["n1", "n2"]));
        let dev = h.add_olt(&foreign, "OLT-001", 2);

        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: None,
            kind: DeviceEventKind::DeviceAdded,
        });
        assert!(h.task_rx.try_recv().is_err());

        // n1 leaves; the ring now maps everything to n2
        h.olt
            .handle_cluster_event(ClusterEvent::InstanceDeactivated(
                NodeId::new("n1"),
            ));
        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: None,
            kind: DeviceEventKind::DeviceAdded,
        });
        assert!(h.task_rx.try_recv().is_ok());
    }

    // Availability changes translate to connect/disconnect work.
    #[test]
    fn test_availability_change_follows_inventory() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);

        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: None,
            kind: DeviceEventKind::DeviceAvailabilityChanged,
        });
        assert_eq!(
            h.task_rx.try_recv().unwrap(),
            ReconcileTask::DeviceConnected { device: dev.clone() }
        );

        h.inventory.set_available(&dev, false);
        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: None,
            kind: DeviceEventKind::DeviceAvailabilityChanged,
        });
        assert_eq!(
            h.task_rx.try_recv().unwrap(),
            ReconcileTask::DeviceDisconnected { device: dev.clone() }
        );

        // a removed device is handled the same way, and the purge copes
        // with the record being gone
        h.inventory.remove_device(&dev);
        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: None,
            kind: DeviceEventKind::DeviceRemoved,
        });
        let task = h.task_rx.try_recv().unwrap();
        assert_eq!(h.run(task), TaskOutcome::Done);
    }

    // Noisy device-event kinds never reach the worker pool.
    #[test]
    fn test_noisy_events_are_filtered() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        for kind in [
            DeviceEventKind::PortStatsUpdated,
            DeviceEventKind::DeviceSuspended,
            DeviceEventKind::DeviceUpdated,
        ] {
            h.olt.handle_device_event(DeviceEvent {
                device: dev.clone(),
                port: Some(PortNo::new(16)),
                kind,
            });
        }
        assert!(h.task_rx.try_recv().is_err());
    }

    // A port-updated event follows the enable bit.
    #[test]
    fn test_port_updated_follows_enable_bit() {
        let mut h = Harness::new();
        let dev = h.add_olt("of:01", "OLT-001", 2);
        h.add_uni(&dev, 16, "BBSM0001-1");

        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: Some(PortNo::new(16)),
            kind: DeviceEventKind::PortUpdated,
        });
        assert_eq!(
            h.task_rx.try_recv().unwrap(),
            ReconcileTask::PortUp { device: dev.clone(), port: PortNo::new(16) }
        );

        h.inventory.set_port(
            &dev,
            AccessPort {
                number: PortNo::new(16),
                name: "BBSM0001-1".to_string(),
                enabled: false,
            },
        );
        h.olt.handle_device_event(DeviceEvent {
            device: dev.clone(),
            port: Some(PortNo::new(16)),
            kind: DeviceEventKind::PortUpdated,
        });
        assert_eq!(
            h.task_rx.try_recv().unwrap(),
            ReconcileTask::PortDown { device: dev, port: PortNo::new(16) }
        );
    }
}
