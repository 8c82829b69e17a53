// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Meter bookkeeping per device.
//!
//! Every bandwidth profile maps to at most one meter per device, and a flow
//! directive may only reference a meter whose installation the driver has
//! confirmed.  Until that confirmation arrives, reconciliation work that
//! depends on the meter is parked on a per-device queue (the replicated
//! `volt-pending-eapol` map, which keeps its historical name) and re-woken
//! when the driver reports the install.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc::UnboundedSender;

use common::ports::DeviceId;
use sbi::MeterId;
use sbi::MeterOps;
use sbi::MeterRequest;
use sbi::ObjectiveError;

use crate::reconcile::ReconcileTask;
use crate::store::ReplicatedMap;
use crate::subscriber::SubscriberLookup;
use crate::types::OltError;
use crate::types::OltResult;

#[derive(Clone, Copy, Debug)]
struct MeterEntry {
    meter: MeterId,
    installed: bool,
}

#[derive(Default)]
struct DeviceMeters {
    // ids are never reused while a binding lives; a plain high-water mark
    // is enough for the handful of profiles a device carries
    next_id: u32,
    by_bp: BTreeMap<String, MeterEntry>,
}

pub struct MeterCache {
    log: slog::Logger,
    app: String,
    subscribers: Arc<dyn SubscriberLookup>,
    meter_ops: Arc<dyn MeterOps>,
    state: RwLock<BTreeMap<DeviceId, DeviceMeters>>,
    // process-local compare-and-set guard: at most one outstanding install
    // per (device, bandwidth profile)
    pending_install: Mutex<BTreeSet<(DeviceId, String)>>,
    parked: ReplicatedMap<DeviceId, Vec<ReconcileTask>>,
    waker: UnboundedSender<ReconcileTask>,
}

impl MeterCache {
    pub fn new(
        log: &slog::Logger,
        app: impl ToString,
        subscribers: Arc<dyn SubscriberLookup>,
        meter_ops: Arc<dyn MeterOps>,
        waker: UnboundedSender<ReconcileTask>,
    ) -> Self {
        MeterCache {
            log: log.new(o!("unit" => "meter-cache")),
            app: app.to_string(),
            subscribers,
            meter_ops,
            state: RwLock::new(BTreeMap::new()),
            pending_install: Mutex::new(BTreeSet::new()),
            parked: ReplicatedMap::new(log, "volt-pending-eapol"),
            waker,
        }
    }

    /// Idempotently make sure a meter exists for the bandwidth profile on
    /// the device.  Returns the meter id and whether its installation has
    /// been confirmed; callers MUST NOT reference an unconfirmed meter in a
    /// directive - park the work instead.
    pub fn ensure_meter(
        &self,
        device: &DeviceId,
        bp_id: &str,
    ) -> OltResult<(MeterId, bool)> {
        if let Some(e) = self.lookup(device, bp_id) {
            return Ok((e.meter, e.installed));
        }

        let Some(bp) = self.subscribers.bandwidth_profile(bp_id) else {
            return Err(OltError::NotConfigured(format!(
                "bandwidth profile \"{bp_id}\""
            )));
        };

        let meter = {
            let mut state = self.state.write().unwrap();
            let dm = state.entry(device.clone()).or_default();
            if let Some(e) = dm.by_bp.get(bp_id) {
                return Ok((e.meter, e.installed));
            }

            let mut pending = self.pending_install.lock().unwrap();
            if !pending.insert((device.clone(), bp_id.to_string())) {
                // an install is already outstanding; don't send another
                return Err(OltError::MeterUnavailable {
                    device: device.clone(),
                    bp: bp_id.to_string(),
                });
            }

            dm.next_id += 1;
            let meter = MeterId::new(dm.next_id);
            dm.by_bp.insert(
                bp_id.to_string(),
                MeterEntry { meter, installed: false },
            );
            meter
        };

        info!(self.log, "requesting meter install";
            "device" => %device, "bp" => bp_id, "meter" => %meter);
        let request = MeterRequest::new(meter, &self.app, bp.to_bands());
        if let Err(e) = self.meter_ops.submit_meter(device, request) {
            // roll back so a later attempt can re-request
            self.forget(device, meter);
            return Err(e.into());
        }

        Ok((meter, false))
    }

    /// The current binding for the profile, installed or not.  Never
    /// allocates.
    pub fn meter_for(&self, device: &DeviceId, bp_id: &str) -> Option<MeterId> {
        self.lookup(device, bp_id).map(|e| e.meter)
    }

    /// Has the driver confirmed this meter?
    pub fn is_installed(&self, device: &DeviceId, meter: MeterId) -> bool {
        self.state
            .read()
            .unwrap()
            .get(device)
            .map(|dm| {
                dm.by_bp
                    .values()
                    .any(|e| e.meter == meter && e.installed)
            })
            .unwrap_or(false)
    }

    /// The bandwidth profile a meter was created for.
    pub fn bp_for(&self, device: &DeviceId, meter: MeterId) -> Option<String> {
        self.state.read().unwrap().get(device).and_then(|dm| {
            dm.by_bp
                .iter()
                .find(|(_, e)| e.meter == meter)
                .map(|(bp, _)| bp.clone())
        })
    }

    /// Park a reconciliation task until a meter install on the device
    /// completes.
    pub fn park(&self, device: &DeviceId, task: ReconcileTask) {
        debug!(self.log, "parking task until meter install";
            "device" => %device, "task" => %task);
        self.parked.compute(device, |q| {
            let mut q = q.unwrap_or_default();
            q.push(task);
            Some(q)
        });
    }

    /// The driver confirmed a meter.  Mark it usable and re-submit every
    /// task parked on this device; tasks are idempotent, so waking all of
    /// them is safe.
    pub fn on_meter_installed(&self, device: &DeviceId, meter: MeterId) {
        let bp = {
            let mut state = self.state.write().unwrap();
            let Some(dm) = state.get_mut(device) else { return };
            let Some((bp, entry)) =
                dm.by_bp.iter_mut().find(|(_, e)| e.meter == meter)
            else {
                debug!(self.log, "install event for unknown meter";
                    "device" => %device, "meter" => %meter);
                return;
            };
            entry.installed = true;
            bp.clone()
        };
        self.pending_install
            .lock()
            .unwrap()
            .remove(&(device.clone(), bp.clone()));
        info!(self.log, "meter installed";
            "device" => %device, "meter" => %meter, "bp" => bp);
        self.drain(device);
    }

    /// The driver rejected a meter.  Drop the binding so the next attempt
    /// re-requests it, then wake parked work to retry.
    pub fn on_meter_failed(
        &self,
        device: &DeviceId,
        meter: MeterId,
        error: ObjectiveError,
    ) {
        warn!(self.log, "meter install failed";
            "device" => %device, "meter" => %meter, "error" => %error);
        self.forget(device, meter);
        self.drain(device);
    }

    /// The device reports no flow references the meter.  Drop the binding
    /// and tell the caller to withdraw it southbound.
    pub fn release(&self, device: &DeviceId, meter: MeterId) -> bool {
        let existed = self.bp_for(device, meter).is_some();
        if existed {
            self.forget(device, meter);
        }
        existed
    }

    /// Remove all bindings and parked work for a departing device.
    pub fn clear(&self, device: &DeviceId) {
        self.state.write().unwrap().remove(device);
        self.pending_install
            .lock()
            .unwrap()
            .retain(|(d, _)| d != device);
        self.parked.remove(device);
        debug!(self.log, "cleared meter state"; "device" => %device);
    }

    /// The number of meters currently bound on the device.
    pub fn meter_count(&self, device: &DeviceId) -> usize {
        self.state
            .read()
            .unwrap()
            .get(device)
            .map(|dm| dm.by_bp.len())
            .unwrap_or(0)
    }

    fn lookup(&self, device: &DeviceId, bp_id: &str) -> Option<MeterEntry> {
        self.state
            .read()
            .unwrap()
            .get(device)
            .and_then(|dm| dm.by_bp.get(bp_id))
            .copied()
    }

    fn forget(&self, device: &DeviceId, meter: MeterId) {
        let mut state = self.state.write().unwrap();
        if let Some(dm) = state.get_mut(device) {
            if let Some(bp) = dm
                .by_bp
                .iter()
                .find(|(_, e)| e.meter == meter)
                .map(|(bp, _)| bp.clone())
            {
                dm.by_bp.remove(&bp);
                self.pending_install
                    .lock()
                    .unwrap()
                    .remove(&(device.clone(), bp));
            }
        }
    }

    fn drain(&self, device: &DeviceId) {
        let Some(parked) = self.parked.remove(device) else { return };
        debug!(self.log, "re-waking {} parked tasks", parked.len();
            "device" => %device);
        for task in parked {
            // the receiver only disappears at shutdown
            let _ = self.waker.send(task);
        }
    }
}
