// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Identity types for access devices and their ports.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// An opaque access-device identifier, assigned by the device connector.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl ToString) -> Self {
        DeviceId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DeviceId(s.to_string()))
    }
}

/// A port number on an access device.  The top of the 32-bit space carries
/// the reserved logical ports of the underlying switch protocol.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct PortNo(u32);

impl PortNo {
    /// The logical port delivering packets to the controller.
    pub const CONTROLLER: PortNo = PortNo(0xffff_fffd);
    /// The switch-local management port.  Never provisioned.
    pub const LOCAL: PortNo = PortNo(0xffff_fffe);

    pub const fn new(n: u32) -> Self {
        PortNo(n)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_logical(&self) -> bool {
        self.0 >= PortNo::CONTROLLER.0
    }
}

impl From<u32> for PortNo {
    fn from(n: u32) -> Self {
        PortNo(n)
    }
}

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PortNo::CONTROLLER => write!(f, "controller"),
            PortNo::LOCAL => write!(f, "local"),
            p => write!(f, "{}", p.0),
        }
    }
}

impl fmt::Debug for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A (device, port) pair: the attachment point of a subscriber or uplink.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize, JsonSchema,
)]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: PortNo,
}

impl ConnectPoint {
    pub fn new(device: DeviceId, port: PortNo) -> Self {
        ConnectPoint { device, port }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}
