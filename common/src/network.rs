// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// A 48-bit MAC address as it travels through subscriber records and
/// learned-host entries.  The control plane never manufactures these; it
/// parses them out of configuration, matches downstream traffic against
/// them, and prints them in logs, so the type is trimmed to exactly that:
/// strict config-format parsing, display, and the two checks that decide
/// whether an address may be used as a downstream destination match.
#[derive(Copy, Deserialize, Serialize, JsonSchema, Clone, Eq, PartialEq)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr {
    octets: [u8; 6],
}

impl MacAddr {
    /// The all-zeros address; subscriber records use it to mean "no MAC
    /// configured".
    pub const UNSPECIFIED: Self = MacAddr { octets: [0; 6] };

    pub const fn new(octets: [u8; 6]) -> MacAddr {
        MacAddr { octets }
    }

    /// True for the all-zeros "no MAC configured" placeholder.
    pub fn is_unspecified(&self) -> bool {
        self.octets == [0; 6]
    }

    /// Group addresses can never identify a single subscriber host, so a
    /// configured or learned multicast MAC is discarded rather than matched
    /// on.
    pub fn is_multicast(&self) -> bool {
        self.octets[0] & 0x01 != 0
    }
}

/// A MAC in a subscriber record didn't parse.  Carries the offending text
/// so the operator can find the bad entry.
#[derive(Error, Debug, Clone)]
#[error("invalid MAC address \"{0}\"")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    // Only the canonical colon-separated form with two hex digits per
    // octet is accepted: subscriber inventories are machine-generated, and
    // anything looser usually means a mangled record.
    fn from_str(s: &str) -> Result<Self, MacParseError> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            *octet = parts
                .next()
                .filter(|p| p.len() == 2)
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .ok_or_else(|| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr { octets })
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, MacParseError> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(m: MacAddr) -> String {
        m.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.octets;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// An 802.1Q VLAN identifier, with the distinguished values used by the
/// access-device control plane.  The on-the-wire space is 0-4095; the values
/// above it are software-only markers:
///
/// - `NO_VID` (0): the frame carries a VLAN header with no VID set.
/// - `ANY` (0x1000): matches any VLAN; also used as a "don't rewrite" marker.
/// - `NONE` (0xffff): untagged; no VLAN header at all.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct VlanId(u16);

/// The highest valid on-the-wire VLAN id.
pub const MAX_VLAN: u16 = 4095;

impl VlanId {
    pub const NO_VID: VlanId = VlanId(0);
    pub const ANY: VlanId = VlanId(0x1000);
    pub const NONE: VlanId = VlanId(0xffff);

    /// Construct a VLAN id, validating that it falls in the on-the-wire
    /// space.
    pub fn new(vid: u16) -> Result<Self, VlanError> {
        if vid > MAX_VLAN {
            Err(VlanError::OutOfRange(vid))
        } else {
            Ok(VlanId(vid))
        }
    }

    /// Construct one of the distinguished software-only values, or a plain
    /// id.  Unlike `new` this admits the full marker space.
    pub const fn from_raw(vid: u16) -> Self {
        VlanId(vid)
    }

    pub fn id(&self) -> u16 {
        self.0
    }

    pub fn is_any(&self) -> bool {
        *self == VlanId::ANY
    }

    pub fn is_none(&self) -> bool {
        *self == VlanId::NONE
    }

    pub fn is_no_vid(&self) -> bool {
        *self == VlanId::NO_VID
    }
}

#[derive(Error, Debug, Clone)]
pub enum VlanError {
    #[error("VLAN id {0} is outside the valid range 0-4095")]
    OutOfRange(u16),
    #[error("Invalid VLAN id: {0}")]
    Invalid(String),
}

impl FromStr for VlanId {
    type Err = VlanError;

    fn from_str(s: &str) -> Result<Self, VlanError> {
        match s {
            "any" => Ok(VlanId::ANY),
            "none" => Ok(VlanId::NONE),
            _ => {
                let vid: u16 = s
                    .parse()
                    .map_err(|_| VlanError::Invalid(s.to_string()))?;
                VlanId::new(vid)
            }
        }
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VlanId::ANY => write!(f, "any"),
            VlanId::NONE => write!(f, "none"),
            v => write!(f, "{}", v.0),
        }
    }
}

impl fmt::Debug for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse() {
        let m: MacAddr = "a8:40:25:00:00:01".parse().unwrap();
        assert_eq!(m, MacAddr::new([0xa8, 0x40, 0x25, 0, 0, 1]));
        assert_eq!(m.to_string(), "a8:40:25:00:00:01");

        // only the canonical config form is accepted
        assert!("a8:40:25:00:01".parse::<MacAddr>().is_err());
        assert!("a8:40:25:00:00:01:02".parse::<MacAddr>().is_err());
        assert!("a8:40:25:00:00:zz".parse::<MacAddr>().is_err());
        assert!("a8:40:25:0:0:1".parse::<MacAddr>().is_err());

        let err = "junk".parse::<MacAddr>().unwrap_err();
        assert!(err.to_string().contains("junk"));
    }

    #[test]
    fn test_mac_destination_checks() {
        assert!(MacAddr::UNSPECIFIED.is_unspecified());
        assert!(!MacAddr::UNSPECIFIED.is_multicast());

        let host = MacAddr::new([0x0a, 0, 0, 0, 0, 1]);
        assert!(!host.is_unspecified());
        assert!(!host.is_multicast());

        // group bit set: not a usable subscriber destination
        let group = MacAddr::new([0x01, 0x00, 0x5e, 0, 0, 1]);
        assert!(group.is_multicast());
    }

    #[test]
    fn test_vlan_bounds() {
        assert!(VlanId::new(4095).is_ok());
        assert!(VlanId::new(4096).is_err());
        assert_eq!(VlanId::new(0).unwrap(), VlanId::NO_VID);
    }

    #[test]
    fn test_vlan_markers() {
        assert!(VlanId::ANY.is_any());
        assert!(VlanId::NONE.is_none());
        assert!(!VlanId::new(101).unwrap().is_any());
        assert_eq!("any".parse::<VlanId>().unwrap(), VlanId::ANY);
        assert_eq!("none".parse::<VlanId>().unwrap(), VlanId::NONE);
        assert_eq!("7".parse::<VlanId>().unwrap(), VlanId::new(7).unwrap());
    }

    #[test]
    fn test_vlan_serde_is_plain_integer() {
        let v = VlanId::new(101).unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "101");
        let v: VlanId = serde_json::from_str("4096").unwrap();
        assert!(v.is_any());
    }
}
