// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A soft southbound driver: accepts every directive, tracks the resulting
//! rules and meters in memory, and plays back the driver event stream the
//! way a device would acknowledge the real thing.  This is the backend the
//! daemon runs with when no hardware driver is connected, and the backend
//! the scenario tests drive.

use std::collections::BTreeMap;
use std::sync::Mutex;

use slog::debug;
use slog::o;
use tokio::sync::mpsc::UnboundedSender;

use common::ports::DeviceId;
use sbi::CompletionContext;
use sbi::FilteringObjective;
use sbi::FlowOps;
use sbi::FlowRule;
use sbi::FlowRuleEvent;
use sbi::FlowRuleEventKind;
use sbi::ForwardingObjective;
use sbi::MeterEvent;
use sbi::MeterEventKind;
use sbi::MeterId;
use sbi::MeterOps;
use sbi::MeterRequest;
use sbi::ObjectiveVerb;
use sbi::SbiResult;
use sbi::SouthboundEvent;
use sbi::TrafficSelector;
use sbi::TrafficTreatment;

pub struct SoftDriver {
    log: slog::Logger,
    events: UnboundedSender<SouthboundEvent>,
    rules: Mutex<BTreeMap<DeviceId, Vec<FlowRule>>>,
    meters: Mutex<BTreeMap<(DeviceId, MeterId), MeterRequest>>,
}

impl SoftDriver {
    pub fn new(
        log: &slog::Logger,
        events: UnboundedSender<SouthboundEvent>,
    ) -> Self {
        SoftDriver {
            log: log.new(o!("unit" => "soft-driver")),
            events,
            rules: Mutex::new(BTreeMap::new()),
            meters: Mutex::new(BTreeMap::new()),
        }
    }

    /// The rules currently installed on a device.
    pub fn rules(&self, device: &DeviceId) -> Vec<FlowRule> {
        self.rules
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_count(&self, device: &DeviceId) -> usize {
        self.rules(device).len()
    }

    pub fn meter_count(&self, device: &DeviceId) -> usize {
        self.meters
            .lock()
            .unwrap()
            .keys()
            .filter(|(d, _)| d == device)
            .count()
    }

    pub fn has_meter(&self, device: &DeviceId, meter: MeterId) -> bool {
        self.meters
            .lock()
            .unwrap()
            .contains_key(&(device.clone(), meter))
    }

    fn apply(
        &self,
        device: &DeviceId,
        verb: ObjectiveVerb,
        app: String,
        priority: u16,
        selector: TrafficSelector,
        treatment: TrafficTreatment,
        ctx: CompletionContext,
    ) {
        let rule = FlowRule {
            device: device.clone(),
            app,
            priority,
            selector,
            treatment,
        };

        let (request, done) = match verb {
            ObjectiveVerb::Add => (
                FlowRuleEventKind::AddRequested,
                FlowRuleEventKind::Added,
            ),
            ObjectiveVerb::Remove => (
                FlowRuleEventKind::RemoveRequested,
                FlowRuleEventKind::Removed,
            ),
        };

        {
            let mut rules = self.rules.lock().unwrap();
            let device_rules = rules.entry(device.clone()).or_default();
            match verb {
                ObjectiveVerb::Add => device_rules.push(rule.clone()),
                ObjectiveVerb::Remove => device_rules
                    .retain(|r| r.selector != rule.selector || r.app != rule.app),
            }
        }
        debug!(self.log, "applied directive"; "device" => %device,
            "verb" => ?verb, "rules" => self.rule_count(device));

        self.emit_rule_event(request, rule.clone());
        self.emit_rule_event(done, rule);
        ctx.complete(Ok(()));
    }

    fn emit_rule_event(&self, kind: FlowRuleEventKind, rule: FlowRule) {
        let _ = self
            .events
            .send(SouthboundEvent::FlowRule(FlowRuleEvent { kind, rule }));
    }
}

impl FlowOps for SoftDriver {
    fn filter(
        &self,
        device: &DeviceId,
        objective: FilteringObjective,
        ctx: CompletionContext,
    ) -> SbiResult<()> {
        let selector = objective.selector();
        self.apply(
            device,
            objective.verb,
            objective.app,
            objective.priority,
            selector,
            objective.meta,
            ctx,
        );
        Ok(())
    }

    fn forward(
        &self,
        device: &DeviceId,
        objective: ForwardingObjective,
        ctx: CompletionContext,
    ) -> SbiResult<()> {
        self.apply(
            device,
            objective.verb,
            objective.app,
            objective.priority,
            objective.selector,
            objective.treatment,
            ctx,
        );
        Ok(())
    }

    fn purge_flows(&self, device: &DeviceId) -> SbiResult<()> {
        let purged = self
            .rules
            .lock()
            .unwrap()
            .remove(device)
            .map(|r| r.len())
            .unwrap_or(0);
        debug!(self.log, "purged {purged} rules"; "device" => %device);
        Ok(())
    }
}

impl MeterOps for SoftDriver {
    fn submit_meter(
        &self,
        device: &DeviceId,
        request: MeterRequest,
    ) -> SbiResult<()> {
        let meter = request.meter;
        let app = request.app.clone();
        self.meters
            .lock()
            .unwrap()
            .insert((device.clone(), meter), request);
        debug!(self.log, "meter submitted"; "device" => %device,
            "meter" => %meter);
        let _ = self.events.send(SouthboundEvent::Meter(MeterEvent {
            device: device.clone(),
            meter,
            app,
            kind: MeterEventKind::Installed,
        }));
        Ok(())
    }

    fn withdraw_meter(
        &self,
        device: &DeviceId,
        meter: MeterId,
    ) -> SbiResult<()> {
        self.meters.lock().unwrap().remove(&(device.clone(), meter));
        debug!(self.log, "meter withdrawn"; "device" => %device,
            "meter" => %meter);
        Ok(())
    }
}
