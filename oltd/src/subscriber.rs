// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The subscriber-information service: who is attached to which UNI, which
//! services they carry, and what the named bandwidth profiles mean.  The
//! daemon only ever reads this data; it is owned by an external inventory
//! system and reached through the [`SubscriberLookup`] trait.  Lookups are
//! keyed by UNI port name for subscribers and by device serial number for
//! OLT-level records.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use common::network::MacAddr;
use common::network::VlanId;
use sbi::MeterBand;

use crate::types::OltResult;

/// The distinguished "no technology profile" id.
pub const NONE_TP_ID: i32 = -1;

/// One service definition for one subscriber.  A subscriber may carry
/// several of these, disambiguated by the (ponCTag, ponSTag,
/// technologyProfileId) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UniTagInformation {
    /// Inner (customer) VLAN on the PON.
    pub pon_c_tag: VlanId,
    /// Outer (service) VLAN on the PON.
    pub pon_s_tag: VlanId,
    /// VLAN expected on the UNI; `ANY` and `NONE` have their usual meaning.
    pub uni_tag_match: VlanId,
    pub us_pon_c_tag_priority: Option<u8>,
    pub us_pon_s_tag_priority: Option<u8>,
    pub ds_pon_c_tag_priority: Option<u8>,
    pub ds_pon_s_tag_priority: Option<u8>,
    pub technology_profile_id: i32,
    pub upstream_bandwidth_profile: Option<String>,
    pub downstream_bandwidth_profile: Option<String>,
    pub upstream_olt_bandwidth_profile: Option<String>,
    pub downstream_olt_bandwidth_profile: Option<String>,
    pub is_dhcp_required: bool,
    pub is_igmp_required: bool,
    pub enable_mac_learning: bool,
    pub configured_mac_address: Option<MacAddr>,
    pub service_name: String,
}

impl Default for UniTagInformation {
    fn default() -> Self {
        UniTagInformation {
            pon_c_tag: VlanId::NONE,
            pon_s_tag: VlanId::NONE,
            uni_tag_match: VlanId::ANY,
            us_pon_c_tag_priority: None,
            us_pon_s_tag_priority: None,
            ds_pon_c_tag_priority: None,
            ds_pon_s_tag_priority: None,
            technology_profile_id: NONE_TP_ID,
            upstream_bandwidth_profile: None,
            downstream_bandwidth_profile: None,
            upstream_olt_bandwidth_profile: None,
            downstream_olt_bandwidth_profile: None,
            is_dhcp_required: false,
            is_igmp_required: false,
            enable_mac_learning: false,
            configured_mac_address: None,
            service_name: String::new(),
        }
    }
}

impl UniTagInformation {
    /// The triple that identifies this service among a subscriber's
    /// services.
    pub fn triple(&self) -> (VlanId, VlanId, i32) {
        (self.pon_c_tag, self.pon_s_tag, self.technology_profile_id)
    }

    /// The configured downstream destination MAC, if one is set and usable
    /// as a host match.
    pub fn configured_mac(&self) -> Option<MacAddr> {
        self.configured_mac_address
            .filter(|m| !m.is_unspecified() && !m.is_multicast())
    }

    /// The bandwidth profiles this service references, deduplicated.
    pub fn bandwidth_profiles(&self) -> Vec<&str> {
        let mut bps: Vec<&str> = [
            &self.upstream_bandwidth_profile,
            &self.downstream_bandwidth_profile,
            &self.upstream_olt_bandwidth_profile,
            &self.downstream_olt_bandwidth_profile,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect();
        bps.sort_unstable();
        bps.dedup();
        bps
    }

    pub fn references_bandwidth_profile(&self, bp_id: &str) -> bool {
        self.bandwidth_profiles().contains(&bp_id)
    }
}

/// A subscriber record, or - when looked up by device serial - the OLT-level
/// record carrying the uplink port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriberInfo {
    /// UNI port name, or device serial for OLT-level records.
    pub id: String,
    /// For OLT-level records: the NNI port number.
    pub uplink_port: Option<u32>,
    pub uni_tag_list: Vec<UniTagInformation>,
}

/// A named set of rate/burst parameters.  Rates are kbps, bursts kbits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BandwidthProfileInformation {
    pub id: String,
    pub committed_information_rate: u64,
    pub committed_burst_size: u64,
    pub exceeded_information_rate: u64,
    pub exceeded_burst_size: u64,
    pub assured_information_rate: u64,
    pub assured_burst_size: u64,
}

impl BandwidthProfileInformation {
    /// The three drop bands of the meter this profile becomes.
    pub fn to_bands(&self) -> Vec<MeterBand> {
        vec![
            MeterBand::new(
                self.committed_information_rate,
                self.committed_burst_size,
            ),
            MeterBand::new(
                self.exceeded_information_rate,
                self.exceeded_burst_size,
            ),
            MeterBand::new(
                self.assured_information_rate,
                self.assured_burst_size,
            ),
        ]
    }
}

/// Read access to the subscriber-information service.  Lookups are
/// synchronous and side-effect-free; an absent entry is `None`.
pub trait SubscriberLookup: Send + Sync {
    /// Look up a subscriber by UNI port name, or an OLT-level record by
    /// device serial number.
    fn subscriber(&self, id: &str) -> Option<SubscriberInfo>;

    /// Look up a bandwidth profile by id.
    fn bandwidth_profile(&self, id: &str)
        -> Option<BandwidthProfileInformation>;
}

/// The file layout accepted by [`StaticSubscribers::from_file`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SubscriberFile {
    subscribers: Vec<SubscriberInfo>,
    bandwidth_profiles: Vec<BandwidthProfileInformation>,
}

/// A subscriber service backed by a static JSON file, for deployments whose
/// inventory is pre-provisioned, and for tests.
pub struct StaticSubscribers {
    subscribers: RwLock<BTreeMap<String, SubscriberInfo>>,
    profiles: RwLock<BTreeMap<String, BandwidthProfileInformation>>,
}

impl StaticSubscribers {
    pub fn new() -> Self {
        StaticSubscribers {
            subscribers: RwLock::new(BTreeMap::new()),
            profiles: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_file(path: &str) -> OltResult<Self> {
        let txt = std::fs::read_to_string(path)?;
        let file: SubscriberFile = serde_json::from_str(&txt)
            .map_err(|e| crate::types::OltError::Other(e.to_string()))?;
        let svc = StaticSubscribers::new();
        for sub in file.subscribers {
            svc.insert_subscriber(sub);
        }
        for bp in file.bandwidth_profiles {
            svc.insert_profile(bp);
        }
        Ok(svc)
    }

    pub fn insert_subscriber(&self, sub: SubscriberInfo) {
        self.subscribers
            .write()
            .unwrap()
            .insert(sub.id.clone(), sub);
    }

    pub fn insert_profile(&self, bp: BandwidthProfileInformation) {
        self.profiles.write().unwrap().insert(bp.id.clone(), bp);
    }
}

impl Default for StaticSubscribers {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberLookup for StaticSubscribers {
    fn subscriber(&self, id: &str) -> Option<SubscriberInfo> {
        self.subscribers.read().unwrap().get(id).cloned()
    }

    fn bandwidth_profile(
        &self,
        id: &str,
    ) -> Option<BandwidthProfileInformation> {
        self.profiles.read().unwrap().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_defaults() {
        let t = UniTagInformation::default();
        assert!(t.pon_c_tag.is_none());
        assert!(t.uni_tag_match.is_any());
        assert_eq!(t.technology_profile_id, NONE_TP_ID);
        assert!(t.configured_mac().is_none());
    }

    #[test]
    fn test_configured_mac_filters_unusable_addresses() {
        let t = UniTagInformation {
            configured_mac_address: Some(MacAddr::UNSPECIFIED),
            ..Default::default()
        };
        assert!(t.configured_mac().is_none());

        let t = UniTagInformation {
            configured_mac_address: Some(MacAddr::new([
                0x01, 0x00, 0x5e, 0, 0, 1,
            ])),
            ..Default::default()
        };
        assert!(t.configured_mac().is_none());

        let t = UniTagInformation {
            configured_mac_address: Some(MacAddr::new([
                0x0a, 0, 0, 0, 0, 1,
            ])),
            ..Default::default()
        };
        assert!(t.configured_mac().is_some());
    }

    #[test]
    fn test_bandwidth_profiles_dedup() {
        let t = UniTagInformation {
            upstream_bandwidth_profile: Some("HSIA".to_string()),
            downstream_bandwidth_profile: Some("HSIA".to_string()),
            upstream_olt_bandwidth_profile: Some("OLT-US".to_string()),
            ..Default::default()
        };
        assert_eq!(t.bandwidth_profiles(), vec!["HSIA", "OLT-US"]);
        assert!(t.references_bandwidth_profile("HSIA"));
        assert!(!t.references_bandwidth_profile("VOIP"));
    }

    #[test]
    fn test_profile_becomes_three_bands() {
        let bp = BandwidthProfileInformation {
            id: "HSIA-US".to_string(),
            committed_information_rate: 100_000,
            committed_burst_size: 1000,
            exceeded_information_rate: 200_000,
            exceeded_burst_size: 2000,
            assured_information_rate: 50_000,
            assured_burst_size: 0,
        };
        let bands = bp.to_bands();
        assert_eq!(bands.len(), 3);
        assert_eq!(bands[0], MeterBand::new(100_000, 1000));
        assert_eq!(bands[1], MeterBand::new(200_000, 2000));
        assert_eq!(bands[2], MeterBand::new(50_000, 0));
    }

    #[test]
    fn test_subscriber_file_parse() {
        let svc = StaticSubscribers::new();
        let sub: SubscriberInfo = serde_json::from_str(
            r#"{
                "id": "BBSM0001-1",
                "uniTagList": [{
                    "ponCTag": 101,
                    "ponSTag": 7,
                    "technologyProfileId": 64,
                    "isDhcpRequired": true,
                    "upstreamBandwidthProfile": "HSIA-US",
                    "downstreamBandwidthProfile": "HSIA-DS",
                    "serviceName": "hsia"
                }]
            }"#,
        )
        .unwrap();
        svc.insert_subscriber(sub);

        let got = svc.subscriber("BBSM0001-1").unwrap();
        assert_eq!(got.uni_tag_list.len(), 1);
        let tag = &got.uni_tag_list[0];
        assert_eq!(tag.pon_c_tag, VlanId::new(101).unwrap());
        assert_eq!(tag.pon_s_tag, VlanId::new(7).unwrap());
        assert!(tag.is_dhcp_required);
        assert!(tag.uni_tag_match.is_any());
        assert!(svc.subscriber("unknown").is_none());
    }
}
