// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-(port, service) flow status, replicated across the cluster.  This is
//! the source of truth for idempotence: the reconciler consults it before
//! emitting, and the flow listener folds the driver's rule events back into
//! it.

use std::cmp::Ordering;
use std::hash::Hash;
use std::hash::Hasher;

use serde::de::Deserializer;
use serde::ser::SerializeTuple;
use serde::ser::Serializer;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;

use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;

use crate::flow::EAPOL_DEFAULT_VLAN;
use crate::inventory::AccessPort;
use crate::store::ReplicatedMap;
use crate::subscriber::UniTagInformation;

/// Lifecycle of one family of flows on one (port, service).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
    schemars::JsonSchema,
)]
pub enum OltFlowsStatus {
    #[default]
    None,
    PendingAdd,
    Added,
    PendingRemove,
    Removed,
    Error,
}

impl OltFlowsStatus {
    /// True when the status represents a flow that is available or in
    /// progress to be available.
    pub fn has_flow(&self) -> bool {
        !matches!(self, OltFlowsStatus::None | OltFlowsStatus::Removed)
    }
}

/// The three independently-tracked flow families of a (port, service).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct OltPortStatus {
    pub default_eapol: OltFlowsStatus,
    pub subscriber_flows: OltFlowsStatus,
    pub dhcp: OltFlowsStatus,
}

impl OltPortStatus {
    fn inactive(&self) -> bool {
        !self.default_eapol.has_flow()
            && !self.subscriber_flows.has_flow()
            && !self.dhcp.has_flow()
    }
}

/// A port identity rich enough to survive replication: the name travels
/// with the key because the subscriber service is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDevicePort {
    pub device: DeviceId,
    pub number: PortNo,
    pub name: String,
}

impl AccessDevicePort {
    pub fn new(device: &DeviceId, port: &AccessPort) -> Self {
        AccessDevicePort {
            device: device.clone(),
            number: port.number,
            name: port.name.clone(),
        }
    }

    pub fn connect_point(&self) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), self.number)
    }
}

/// The primary key for all per-service state: one (port, service) pair.
/// Two keys are equal when they name the same port and the same
/// (ponCTag, ponSTag, technologyProfileId) triple; the rest of the service
/// definition rides along for the components that need it.
#[derive(Debug, Clone)]
pub struct ServiceKey {
    pub port: AccessDevicePort,
    pub tag: UniTagInformation,
}

impl ServiceKey {
    pub fn new(port: AccessDevicePort, tag: UniTagInformation) -> Self {
        ServiceKey { port, tag }
    }

    /// The canonical key tracking the default EAPOL trap of a port.
    pub fn default_eapol(port: AccessDevicePort) -> Self {
        ServiceKey {
            port,
            tag: UniTagInformation {
                pon_c_tag: EAPOL_DEFAULT_VLAN,
                service_name: "defaultEapol".to_string(),
                ..Default::default()
            },
        }
    }

    /// The canonical key tracking the trap flows of an NNI port.
    pub fn nni(port: AccessDevicePort) -> Self {
        ServiceKey {
            port,
            tag: UniTagInformation {
                service_name: "nni".to_string(),
                ..Default::default()
            },
        }
    }

    /// Is this the canonical default-EAPOL key of its port?
    pub fn is_default_eapol(&self) -> bool {
        self.tag.pon_c_tag == EAPOL_DEFAULT_VLAN
            && self.tag.service_name == "defaultEapol"
    }

    /// Is this the canonical NNI key of its port?
    pub fn is_nni(&self) -> bool {
        self.tag.service_name == "nni"
    }

    fn cmp_key(&self) -> (&DeviceId, PortNo, VlanId, VlanId, i32) {
        (
            &self.port.device,
            self.port.number,
            self.tag.pon_c_tag,
            self.tag.pon_s_tag,
            self.tag.technology_profile_id,
        )
    }

    pub fn on_port(&self, cp: &ConnectPoint) -> bool {
        self.port.device == cp.device && self.port.number == cp.port
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}

impl Eq for ServiceKey {}

impl Ord for ServiceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

impl PartialOrd for ServiceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cmp_key().hash(state);
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{} svc {} c={} s={} tp={}",
            self.port.device,
            self.port.number,
            self.tag.service_name,
            self.tag.pon_c_tag,
            self.tag.pon_s_tag,
            self.tag.technology_profile_id,
        )
    }
}

// The wire format is the stable 6-tuple
// (portDeviceId, portNumber, portName, ponCTag, ponSTag, techProfileId).
// Everything that participates in equality round-trips; the rest of the
// service definition is reloaded from the subscriber service when needed.
impl Serialize for ServiceKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut t = s.serialize_tuple(6)?;
        t.serialize_element(&self.port.device)?;
        t.serialize_element(&self.port.number)?;
        t.serialize_element(&self.port.name)?;
        t.serialize_element(&self.tag.pon_c_tag)?;
        t.serialize_element(&self.tag.pon_s_tag)?;
        t.serialize_element(&self.tag.technology_profile_id)?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for ServiceKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let (device, number, name, c_tag, s_tag, tp_id): (
            DeviceId,
            PortNo,
            String,
            VlanId,
            VlanId,
            i32,
        ) = Deserialize::deserialize(d)?;
        Ok(ServiceKey {
            port: AccessDevicePort { device, number, name },
            tag: UniTagInformation {
                pon_c_tag: c_tag,
                pon_s_tag: s_tag,
                technology_profile_id: tp_id,
                ..Default::default()
            },
        })
    }
}

/// A merge of new sub-statuses into an [`OltPortStatus`]: `None` fields are
/// left as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusUpdate {
    pub default_eapol: Option<OltFlowsStatus>,
    pub subscriber_flows: Option<OltFlowsStatus>,
    pub dhcp: Option<OltFlowsStatus>,
}

impl StatusUpdate {
    pub fn default_eapol(s: OltFlowsStatus) -> Self {
        StatusUpdate { default_eapol: Some(s), ..Default::default() }
    }

    pub fn subscriber_flows(s: OltFlowsStatus) -> Self {
        StatusUpdate { subscriber_flows: Some(s), ..Default::default() }
    }

    pub fn dhcp(s: OltFlowsStatus) -> Self {
        StatusUpdate { dhcp: Some(s), ..Default::default() }
    }
}

/// The cluster-replicated status of every (port, service) this instance has
/// touched, plus the operator's provisioning intent.
pub struct StatusStore {
    log: slog::Logger,
    cp_status: ReplicatedMap<ServiceKey, OltPortStatus>,
    provisioned: ReplicatedMap<ServiceKey, bool>,
}

impl StatusStore {
    pub fn new(log: &slog::Logger) -> Self {
        StatusStore {
            log: log.new(slog::o!("unit" => "status-store")),
            cp_status: ReplicatedMap::new(log, "volt-cp-status"),
            provisioned: ReplicatedMap::new(
                log,
                "volt-provisioned-subscriber",
            ),
        }
    }

    /// Merge `upd` into the entry for `key`.  A single compare-and-update,
    /// so a reconciler write and a flow-listener write never clobber each
    /// other.  An entry whose three families all end up with no flow is
    /// dropped.
    pub fn update(&self, key: &ServiceKey, upd: StatusUpdate) {
        self.cp_status.compute(key, |current| {
            let mut status = current.unwrap_or_default();
            if let Some(s) = upd.default_eapol {
                status.default_eapol = s;
            }
            if let Some(s) = upd.subscriber_flows {
                status.subscriber_flows = s;
            }
            if let Some(s) = upd.dhcp {
                status.dhcp = s;
            }
            if status.inactive() {
                None
            } else {
                Some(status)
            }
        });
        debug!(self.log, "status updated"; "key" => %key,
            "update" => ?upd);
    }

    pub fn get(&self, key: &ServiceKey) -> Option<OltPortStatus> {
        self.cp_status.get(key)
    }

    /// Every tracked (service, status) on the given port.
    pub fn port_status(
        &self,
        cp: &ConnectPoint,
    ) -> Vec<(ServiceKey, OltPortStatus)> {
        self.cp_status
            .entries()
            .into_iter()
            .filter(|(k, _)| k.on_port(cp))
            .collect()
    }

    pub fn entries(&self) -> Vec<(ServiceKey, OltPortStatus)> {
        self.cp_status.entries()
    }

    /// Is a default EAPOL trap present (or coming) on the port?  `Error`
    /// counts as present: the southbound keeps retrying it.
    pub fn has_default_eapol(&self, cp: &ConnectPoint) -> bool {
        self.port_status(cp).iter().any(|(_, s)| {
            matches!(
                s.default_eapol,
                OltFlowsStatus::Added
                    | OltFlowsStatus::PendingAdd
                    | OltFlowsStatus::Error
            )
        })
    }

    pub fn is_default_eapol_pending_removal(&self, cp: &ConnectPoint) -> bool {
        self.port_status(cp)
            .iter()
            .any(|(_, s)| s.default_eapol == OltFlowsStatus::PendingRemove)
    }

    fn service_status(
        &self,
        cp: &ConnectPoint,
        tag: &UniTagInformation,
    ) -> Option<OltPortStatus> {
        self.port_status(cp)
            .into_iter()
            .find(|(k, _)| k.tag.triple() == tag.triple())
            .map(|(_, s)| s)
    }

    pub fn has_dhcp_flows(
        &self,
        cp: &ConnectPoint,
        tag: &UniTagInformation,
    ) -> bool {
        self.service_status(cp, tag)
            .map(|s| {
                matches!(
                    s.dhcp,
                    OltFlowsStatus::Added | OltFlowsStatus::PendingAdd
                )
            })
            .unwrap_or(false)
    }

    pub fn has_subscriber_flows(
        &self,
        cp: &ConnectPoint,
        tag: &UniTagInformation,
    ) -> bool {
        self.service_status(cp, tag)
            .map(|s| {
                matches!(
                    s.subscriber_flows,
                    OltFlowsStatus::Added | OltFlowsStatus::PendingAdd
                )
            })
            .unwrap_or(false)
    }

    /// Record or clear operator intent for one (port, service).
    pub fn set_provisioned(&self, key: &ServiceKey, provisioned: bool) {
        if provisioned {
            self.provisioned.put(key.clone(), true);
        } else {
            self.provisioned.remove(key);
        }
    }

    pub fn is_provisioned(&self, key: &ServiceKey) -> bool {
        self.provisioned.get(key).unwrap_or(false)
    }

    /// The services the operator has programmed, with their full
    /// definitions.
    pub fn programmed(&self) -> Vec<ServiceKey> {
        self.provisioned
            .entries()
            .into_iter()
            .filter(|(_, v)| *v)
            .map(|(k, _)| k)
            .collect()
    }

    pub fn programmed_on(&self, cp: &ConnectPoint) -> Vec<ServiceKey> {
        self.programmed().into_iter().filter(|k| k.on_port(cp)).collect()
    }

    /// Does any programmed service on the device reference the bandwidth
    /// profile?
    pub fn device_uses_bandwidth_profile(
        &self,
        device: &DeviceId,
        bp_id: &str,
    ) -> bool {
        self.programmed()
            .iter()
            .filter(|k| k.port.device == *device)
            .any(|k| k.tag.references_bandwidth_profile(bp_id))
    }

    /// Drop every ServiceKey and provisioned entry belonging to the device.
    pub fn purge_device(&self, device: &DeviceId) {
        let statuses =
            self.cp_status.drain_filter(|k, _| k.port.device != *device);
        let programmed =
            self.provisioned.drain_filter(|k, _| k.port.device != *device);
        debug!(self.log, "purged device state"; "device" => %device,
            "statuses" => statuses.len(), "programmed" => programmed.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> slog::Logger {
        use slog::Drain;
        let dec =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(dec).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    fn port(dev: &str, n: u32, name: &str) -> AccessDevicePort {
        AccessDevicePort {
            device: DeviceId::new(dev),
            number: PortNo::new(n),
            name: name.to_string(),
        }
    }

    fn tag(c: u16, s: u16, tp: i32) -> UniTagInformation {
        UniTagInformation {
            pon_c_tag: VlanId::new(c).unwrap(),
            pon_s_tag: VlanId::new(s).unwrap(),
            technology_profile_id: tp,
            service_name: "hsia".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_key_equality_is_port_plus_triple() {
        let a = ServiceKey::new(port("of:01", 16, "u1"), tag(101, 7, 64));
        let mut richer = tag(101, 7, 64);
        richer.is_dhcp_required = true;
        richer.service_name = "other".to_string();
        let b = ServiceKey::new(port("of:01", 16, "u1"), richer);
        assert_eq!(a, b);

        let c = ServiceKey::new(port("of:01", 16, "u1"), tag(102, 7, 64));
        assert_ne!(a, c);
        let d = ServiceKey::new(port("of:01", 17, "u2"), tag(101, 7, 64));
        assert_ne!(a, d);
    }

    #[test]
    fn test_key_wire_format_is_the_six_tuple() {
        let key = ServiceKey::new(port("of:01", 16, "u1"), tag(101, 7, 64));
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["of:01",16,"u1",101,7,64]"#);

        let back: ServiceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
        assert_eq!(back.port.name, "u1");
    }

    #[test]
    fn test_update_merge_contract() {
        let store = StatusStore::new(&test_log());
        let key = ServiceKey::new(port("of:01", 16, "u1"), tag(101, 7, 64));

        store.update(&key, StatusUpdate::dhcp(OltFlowsStatus::PendingAdd));
        store.update(
            &key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::PendingAdd),
        );

        let s = store.get(&key).unwrap();
        // the second write must not have clobbered the first field
        assert_eq!(s.dhcp, OltFlowsStatus::PendingAdd);
        assert_eq!(s.subscriber_flows, OltFlowsStatus::PendingAdd);
        assert_eq!(s.default_eapol, OltFlowsStatus::None);
    }

    #[test]
    fn test_fully_inactive_entry_is_dropped() {
        let store = StatusStore::new(&test_log());
        let key = ServiceKey::new(port("of:01", 16, "u1"), tag(101, 7, 64));

        store.update(
            &key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::PendingAdd),
        );
        assert!(store.get(&key).is_some());

        store.update(
            &key,
            StatusUpdate::subscriber_flows(OltFlowsStatus::Removed),
        );
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_default_eapol_queries() {
        let store = StatusStore::new(&test_log());
        let p = port("of:01", 16, "u1");
        let cp = p.connect_point();
        let key = ServiceKey::default_eapol(p);

        assert!(!store.has_default_eapol(&cp));
        store.update(
            &key,
            StatusUpdate::default_eapol(OltFlowsStatus::PendingAdd),
        );
        assert!(store.has_default_eapol(&cp));

        // an errored trap still counts as present
        store.update(&key, StatusUpdate::default_eapol(OltFlowsStatus::Error));
        assert!(store.has_default_eapol(&cp));

        store.update(
            &key,
            StatusUpdate::default_eapol(OltFlowsStatus::PendingRemove),
        );
        assert!(!store.has_default_eapol(&cp));
        assert!(store.is_default_eapol_pending_removal(&cp));
    }

    #[test]
    fn test_purge_completeness() {
        let store = StatusStore::new(&test_log());
        let a = ServiceKey::new(port("of:01", 16, "u1"), tag(101, 7, 64));
        let b = ServiceKey::new(port("of:02", 16, "u9"), tag(101, 7, 64));

        store.update(&a, StatusUpdate::dhcp(OltFlowsStatus::Added));
        store.update(&b, StatusUpdate::dhcp(OltFlowsStatus::Added));
        store.set_provisioned(&a, true);
        store.set_provisioned(&b, true);

        store.purge_device(&DeviceId::new("of:01"));

        assert!(store
            .entries()
            .iter()
            .all(|(k, _)| k.port.device != DeviceId::new("of:01")));
        assert!(store.get(&b).is_some());
        assert!(!store.is_provisioned(&a));
        assert!(store.is_provisioned(&b));
    }

    #[test]
    fn test_bandwidth_profile_usage() {
        let store = StatusStore::new(&test_log());
        let mut t = tag(101, 7, 64);
        t.upstream_bandwidth_profile = Some("HSIA-US".to_string());
        let key = ServiceKey::new(port("of:01", 16, "u1"), t);
        store.set_provisioned(&key, true);

        let dev = DeviceId::new("of:01");
        assert!(store.device_uses_bandwidth_profile(&dev, "HSIA-US"));
        assert!(!store.device_uses_bandwidth_profile(&dev, "HSIA-DS"));

        store.set_provisioned(&key, false);
        assert!(!store.device_uses_bandwidth_profile(&dev, "HSIA-US"));
    }
}
