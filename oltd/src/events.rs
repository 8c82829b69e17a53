// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Event plumbing.  Each source (device connector, southbound driver,
//! cluster membership) feeds its own serialised queue; a single pump task
//! per queue applies the filters and hands work to the reconciliation
//! worker pool.

use std::sync::Arc;

use slog::debug;
use slog::info;
use slog::warn;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;
use sbi::MeterEvent;
use sbi::MeterEventKind;
use sbi::SouthboundEvent;

use crate::cluster::ClusterEvent;
use crate::reconcile::ReconcileTask;
use crate::Olt;

/// What the device connector reports.  The first six kinds drive
/// reconciliation; the rest are noise this daemon filters out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    PortAdded,
    PortRemoved,
    PortUpdated,
    DeviceAdded,
    DeviceRemoved,
    DeviceAvailabilityChanged,
    PortStatsUpdated,
    DeviceSuspended,
    DeviceUpdated,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub device: DeviceId,
    pub port: Option<PortNo>,
    pub kind: DeviceEventKind,
}

impl Olt {
    /// Translate one device event into reconciliation work.  Noisy kinds
    /// are dropped first, then events for devices owned elsewhere.
    pub fn handle_device_event(&self, ev: DeviceEvent) {
        match ev.kind {
            DeviceEventKind::PortStatsUpdated
            | DeviceEventKind::DeviceSuspended
            | DeviceEventKind::DeviceUpdated => return,
            _ => (),
        }
        if !self.is_device_mine(&ev.device) {
            debug!(self.log, "event for foreign device";
                "device" => %ev.device, "kind" => ?ev.kind);
            return;
        }
        debug!(self.log, "device event"; "device" => %ev.device,
            "kind" => ?ev.kind, "port" => ?ev.port);

        match ev.kind {
            DeviceEventKind::PortAdded => {
                if let Some(port) = ev.port {
                    self.submit(ReconcileTask::PortUp {
                        device: ev.device,
                        port,
                    });
                }
            }
            DeviceEventKind::PortRemoved => {
                if let Some(port) = ev.port {
                    self.submit(ReconcileTask::PortDown {
                        device: ev.device,
                        port,
                    });
                }
            }
            DeviceEventKind::PortUpdated => {
                // an enable-bit toggle is an add or a remove in disguise
                let Some(port) = ev.port else { return };
                let cp = ConnectPoint::new(ev.device.clone(), port);
                let enabled = self
                    .inventory
                    .port(&cp)
                    .map(|p| p.enabled)
                    .unwrap_or(false);
                if enabled {
                    self.submit(ReconcileTask::PortUp {
                        device: ev.device,
                        port,
                    });
                } else {
                    self.submit(ReconcileTask::PortDown {
                        device: ev.device,
                        port,
                    });
                }
            }
            DeviceEventKind::DeviceAdded => {
                self.submit(ReconcileTask::DeviceConnected {
                    device: ev.device,
                });
            }
            DeviceEventKind::DeviceRemoved => {
                self.submit(ReconcileTask::DeviceDisconnected {
                    device: ev.device,
                });
            }
            DeviceEventKind::DeviceAvailabilityChanged => {
                if self.inventory.is_available(&ev.device) {
                    self.submit(ReconcileTask::DeviceConnected {
                        device: ev.device,
                    });
                } else {
                    self.submit(ReconcileTask::DeviceDisconnected {
                        device: ev.device,
                    });
                }
            }
            _ => (),
        }
    }

    /// Dispatch one driver event to the flow listener or the meter cache.
    pub fn handle_southbound_event(&self, ev: SouthboundEvent) {
        match ev {
            SouthboundEvent::FlowRule(ev) => self.handle_flow_rule_event(ev),
            SouthboundEvent::Meter(ev) => self.handle_meter_event(ev),
        }
    }

    fn handle_meter_event(&self, ev: MeterEvent) {
        if ev.app != crate::APP_NAME {
            return;
        }
        if !self.is_device_mine(&ev.device) {
            return;
        }
        match ev.kind {
            MeterEventKind::Installed => {
                self.meters.on_meter_installed(&ev.device, ev.meter);
            }
            MeterEventKind::Failed(error) => {
                self.meters.on_meter_failed(&ev.device, ev.meter, error);
            }
            MeterEventKind::ReferenceCountZero => {
                self.meter_reference_count_zero(&ev.device, ev.meter);
            }
        }
    }

    /// The device reports the meter unreferenced.  Withdraw it, unless a
    /// programmed subscriber still needs its bandwidth profile.
    fn meter_reference_count_zero(
        &self,
        device: &DeviceId,
        meter: sbi::MeterId,
    ) {
        let Some(bp) = self.meters.bp_for(device, meter) else {
            debug!(self.log, "reference-count-zero for unknown meter";
                "device" => %device, "meter" => %meter);
            return;
        };
        if self.status.device_uses_bandwidth_profile(device, &bp) {
            debug!(self.log, "meter still backs a programmed subscriber";
                "device" => %device, "meter" => %meter, "bp" => bp);
            return;
        }
        if self.meters.release(device, meter) {
            info!(self.log, "withdrawing unreferenced meter";
                "device" => %device, "meter" => %meter, "bp" => bp);
            if let Err(e) = self.meter_ops.withdraw_meter(device, meter) {
                warn!(self.log, "meter withdrawal failed";
                    "device" => %device, "meter" => %meter, "error" => %e);
            }
        }
    }

    /// Membership changes reshape the ring; devices re-hash on their next
    /// event.
    pub fn handle_cluster_event(&self, ev: ClusterEvent) {
        let mut hasher = self.hasher.lock().unwrap();
        match ev {
            ClusterEvent::InstanceReady(node) => {
                info!(self.log, "cluster instance ready"; "node" => %node);
                hasher.add_server(node);
            }
            ClusterEvent::InstanceDeactivated(node) => {
                info!(self.log, "cluster instance deactivated";
                    "node" => %node);
                hasher.remove_server(&node);
            }
        }
    }
}

/// Pump the device-event queue.  Single consumer: device events for one
/// component are totally ordered.
pub async fn device_event_pump(
    olt: Arc<Olt>,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(ev) = rx.recv().await {
        olt.handle_device_event(ev);
    }
    debug!(olt.log, "device event pump stopped");
}

/// Pump the driver's event stream.
pub async fn southbound_event_pump(
    olt: Arc<Olt>,
    mut rx: mpsc::UnboundedReceiver<SouthboundEvent>,
) {
    while let Some(ev) = rx.recv().await {
        olt.handle_southbound_event(ev);
    }
    debug!(olt.log, "southbound event pump stopped");
}

/// Pump cluster membership changes.
pub async fn cluster_event_pump(
    olt: Arc<Olt>,
    mut rx: mpsc::UnboundedReceiver<ClusterEvent>,
) {
    while let Some(ev) = rx.recv().await {
        olt.handle_cluster_event(ev);
    }
    debug!(olt.log, "cluster event pump stopped");
}

/// One reconciliation worker.  The pool shares a single receiver; whoever
/// grabs the lock first takes the next task.
pub async fn reconcile_worker(
    olt: Arc<Olt>,
    rx: Arc<TokioMutex<mpsc::UnboundedReceiver<ReconcileTask>>>,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else { break };
        olt.reconcile(task);
    }
    debug!(olt.log, "reconcile worker stopped");
}
