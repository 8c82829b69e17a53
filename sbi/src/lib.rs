// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The daemon programs access devices through a southbound driver: trap-style
//! filters, match->treatment forwarding rules, and rate-limiting meters.
//! Each driver backend differs in how it reaches the hardware, so this
//! library defines the directive data model and the capability traits the
//! daemon requires, in a backend-neutral way.  Drivers accept directives
//! synchronously, report per-directive completion through a callback, and
//! stream rule/meter lifecycle events back through [`SouthboundEvent`].

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use common::ports::DeviceId;

mod meter;
pub use meter::*;

mod objective;
pub use objective::*;

/// A specialized Result type for southbound operations
pub type SbiResult<T> = Result<T, SbiError>;

/// Error type conveying additional information about southbound errors
#[derive(Error, Debug)]
pub enum SbiError {
    /// No driver is connected for the target device.
    #[error("no driver connected for device {}", .0)]
    NotConnected(String),
    /// An argument passed to the driver is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// The driver detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
}

/// The asynchronous outcome of a single directive, reported by the driver
/// once the device has acknowledged (or rejected) it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ObjectiveError {
    /// The directive was malformed or referenced unknown state.
    BadParams,
    /// The device rejected the directive for an unspecified reason.
    Unknown,
    /// A transient condition; the driver retries on its own.
    Transient,
}

impl std::fmt::Display for ObjectiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectiveError::BadParams => write!(f, "bad parameters"),
            ObjectiveError::Unknown => write!(f, "unknown error"),
            ObjectiveError::Transient => write!(f, "transient error"),
        }
    }
}

/// Per-directive completion callback.  The driver fires it exactly once,
/// after the device acknowledges the directive.  Callers that don't care
/// pass [`CompletionContext::none`].
pub struct CompletionContext(
    Option<Box<dyn FnOnce(Result<(), ObjectiveError>) + Send>>,
);

impl CompletionContext {
    pub fn none() -> Self {
        CompletionContext(None)
    }

    pub fn on_complete(
        f: impl FnOnce(Result<(), ObjectiveError>) + Send + 'static,
    ) -> Self {
        CompletionContext(Some(Box::new(f)))
    }

    /// Fire the callback with the directive's outcome.
    pub fn complete(self, result: Result<(), ObjectiveError>) {
        if let Some(f) = self.0 {
            f(result);
        }
    }
}

impl std::fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.0 {
            Some(_) => write!(f, "CompletionContext(callback)"),
            None => write!(f, "CompletionContext(none)"),
        }
    }
}

/// The flow-programming operations the daemon requires of a driver.
pub trait FlowOps: Send + Sync {
    /// Install or remove a trap-style filtering directive.
    fn filter(
        &self,
        device: &DeviceId,
        objective: FilteringObjective,
        ctx: CompletionContext,
    ) -> SbiResult<()>;

    /// Install or remove a match->treatment forwarding directive.
    fn forward(
        &self,
        device: &DeviceId,
        objective: ForwardingObjective,
        ctx: CompletionContext,
    ) -> SbiResult<()>;

    /// Remove every flow rule installed on the device, regardless of origin.
    /// Used when a device disconnects and its port space can no longer be
    /// trusted.
    fn purge_flows(&self, device: &DeviceId) -> SbiResult<()>;
}

/// The meter-programming operations the daemon requires of a driver.
pub trait MeterOps: Send + Sync {
    /// Submit a meter for installation.  The outcome arrives as a
    /// [`MeterEvent`].
    fn submit_meter(
        &self,
        device: &DeviceId,
        request: MeterRequest,
    ) -> SbiResult<()>;

    /// Withdraw a previously installed meter.
    fn withdraw_meter(
        &self,
        device: &DeviceId,
        meter: MeterId,
    ) -> SbiResult<()>;
}

/// One flow rule as the driver reports it.  This is the driver's view of the
/// rule: the daemon classifies these by inspecting the selector and
/// treatment, it never assumes they originated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub device: DeviceId,
    pub app: String,
    pub priority: u16,
    pub selector: TrafficSelector,
    pub treatment: TrafficTreatment,
}

/// Lifecycle stages of a flow rule, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRuleEventKind {
    AddRequested,
    Added,
    RemoveRequested,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRuleEvent {
    pub kind: FlowRuleEventKind,
    pub rule: FlowRule,
}

/// Lifecycle stages of a meter, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterEventKind {
    Installed,
    Failed(ObjectiveError),
    /// The device reports no flow references the meter any longer.
    ReferenceCountZero,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEvent {
    pub device: DeviceId,
    pub meter: MeterId,
    pub app: String,
    pub kind: MeterEventKind,
}

/// The event stream a driver feeds back to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SouthboundEvent {
    FlowRule(FlowRuleEvent),
    Meter(MeterEvent),
}
