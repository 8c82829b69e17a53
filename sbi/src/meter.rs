// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies one meter on one device.  Ids are allocated by the meter
/// cache, scoped per device, and never reused while the binding lives.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct MeterId(u32);

impl MeterId {
    pub const fn new(id: u32) -> Self {
        MeterId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "meter:{}", self.0)
    }
}

/// One band of a meter: traffic beyond `rate` (kbps) with bursts beyond
/// `burst_size` (kbits) is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterBand {
    pub rate: u64,
    pub burst_size: u64,
}

impl MeterBand {
    pub fn new(rate: u64, burst_size: u64) -> Self {
        MeterBand { rate, burst_size }
    }
}

/// A meter-install request.  Access bandwidth profiles always produce three
/// drop bands: committed, exceeded, and assured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRequest {
    pub meter: MeterId,
    pub app: String,
    pub bands: Vec<MeterBand>,
}

impl MeterRequest {
    pub fn new(
        meter: MeterId,
        app: impl ToString,
        bands: Vec<MeterBand>,
    ) -> Self {
        MeterRequest { meter, app: app.to_string(), bands }
    }
}
