// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the daemon.

use std::convert;

use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use sbi::ObjectiveError;
use sbi::SbiError;

pub type OltResult<T> = Result<T, OltError>;

/// The error taxonomy of the reconciliation engine.  The first six variants
/// are the domain outcomes; the rest are plumbing.
#[derive(Debug, thiserror::Error)]
pub enum OltError {
    /// The device hashes to another cluster instance.  Never an operator
    /// failure: requests for foreign devices are silently skipped.
    #[error("device {0} is not owned by this instance")]
    NotOwned(DeviceId),
    /// A subscriber or OLT is absent from the subscriber-information service.
    #[error("not configured: {0}")]
    NotConfigured(String),
    /// A required meter has been requested but not yet confirmed; the task
    /// retries once the meter is installed.
    #[error("meter for bandwidth profile \"{bp}\" on {device} is not installed yet")]
    MeterUnavailable { device: DeviceId, bp: String },
    /// MAC learning is enabled for the service but no host has been observed
    /// on the connect point yet.
    #[error("waiting for MAC learning on {cp} vlan {vlan}")]
    MacPending { cp: ConnectPoint, vlan: VlanId },
    /// The southbound driver rejected a directive.
    #[error("southbound error: {0}")]
    Southbound(ObjectiveError),
    /// Malformed operator input, rejected synchronously.
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("driver error: {0}")]
    Sbi(SbiError),
    #[error("Error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for OltError {
    fn from(err: std::io::Error) -> Self {
        OltError::Io(err)
    }
}

impl convert::From<SbiError> for OltError {
    fn from(err: SbiError) -> Self {
        OltError::Sbi(err)
    }
}

impl convert::From<ObjectiveError> for OltError {
    fn from(err: ObjectiveError) -> Self {
        OltError::Southbound(err)
    }
}

impl convert::From<String> for OltError {
    fn from(err: String) -> Self {
        OltError::Other(err)
    }
}

impl convert::From<&str> for OltError {
    fn from(err: &str) -> Self {
        OltError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for OltError {
    fn from(err: anyhow::Error) -> Self {
        OltError::Other(err.to_string())
    }
}
