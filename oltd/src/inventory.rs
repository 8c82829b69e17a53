// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The device inventory: which access devices are connected, which ports
//! they expose, and which hosts have been learned behind those ports.  The
//! inventory is maintained by the device connector; the daemon reads it and
//! reacts to its event stream.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use common::network::MacAddr;
use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;

/// Port names beginning with this prefix mark an NNI when the uplink port is
/// misconfigured or missing in the subscriber service.
pub const NNI_PREFIX: &str = "nni-";

/// One connected access device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDevice {
    pub id: DeviceId,
    /// Serial number; the key of the device's OLT-level record in the
    /// subscriber service.
    pub serial: String,
}

/// One port of an access device.  The name annotation is the subscriber key
/// for UNIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPort {
    pub number: PortNo,
    pub name: String,
    pub enabled: bool,
}

/// A host learned behind a connect point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub mac: MacAddr,
    pub vlan: VlanId,
}

/// Read access to the device inventory and the learned-host table.
pub trait DeviceInventory: Send + Sync {
    fn devices(&self) -> Vec<AccessDevice>;
    fn device(&self, id: &DeviceId) -> Option<AccessDevice>;
    fn ports(&self, id: &DeviceId) -> Vec<AccessPort>;
    fn port(&self, cp: &ConnectPoint) -> Option<AccessPort>;
    fn is_available(&self, id: &DeviceId) -> bool;
    fn connected_hosts(&self, cp: &ConnectPoint) -> Vec<HostInfo>;
}

#[derive(Default)]
struct DeviceRecord {
    device: Option<AccessDevice>,
    available: bool,
    ports: BTreeMap<PortNo, AccessPort>,
}

/// An inventory held entirely in process memory, populated by whatever
/// connector feeds the daemon.  Also the inventory the tests drive.
#[derive(Default)]
pub struct InMemoryInventory {
    devices: RwLock<BTreeMap<DeviceId, DeviceRecord>>,
    hosts: RwLock<BTreeMap<ConnectPoint, Vec<HostInfo>>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: AccessDevice) {
        let mut devices = self.devices.write().unwrap();
        let rec = devices.entry(device.id.clone()).or_default();
        rec.device = Some(device);
        rec.available = true;
    }

    pub fn remove_device(&self, id: &DeviceId) {
        self.devices.write().unwrap().remove(id);
    }

    pub fn set_available(&self, id: &DeviceId, available: bool) {
        if let Some(rec) = self.devices.write().unwrap().get_mut(id) {
            rec.available = available;
        }
    }

    pub fn set_port(&self, id: &DeviceId, port: AccessPort) {
        let mut devices = self.devices.write().unwrap();
        let rec = devices.entry(id.clone()).or_default();
        rec.ports.insert(port.number, port);
    }

    pub fn remove_port(&self, cp: &ConnectPoint) {
        if let Some(rec) = self.devices.write().unwrap().get_mut(&cp.device) {
            rec.ports.remove(&cp.port);
        }
    }

    pub fn learn_host(&self, cp: ConnectPoint, host: HostInfo) {
        self.hosts.write().unwrap().entry(cp).or_default().push(host);
    }
}

impl DeviceInventory for InMemoryInventory {
    fn devices(&self) -> Vec<AccessDevice> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter_map(|r| r.device.clone())
            .collect()
    }

    fn device(&self, id: &DeviceId) -> Option<AccessDevice> {
        self.devices
            .read()
            .unwrap()
            .get(id)
            .and_then(|r| r.device.clone())
    }

    fn ports(&self, id: &DeviceId) -> Vec<AccessPort> {
        self.devices
            .read()
            .unwrap()
            .get(id)
            .map(|r| r.ports.values().cloned().collect())
            .unwrap_or_default()
    }

    fn port(&self, cp: &ConnectPoint) -> Option<AccessPort> {
        self.devices
            .read()
            .unwrap()
            .get(&cp.device)
            .and_then(|r| r.ports.get(&cp.port).cloned())
    }

    fn is_available(&self, id: &DeviceId) -> bool {
        self.devices
            .read()
            .unwrap()
            .get(id)
            .map(|r| r.available)
            .unwrap_or(false)
    }

    fn connected_hosts(&self, cp: &ConnectPoint) -> Vec<HostInfo> {
        self.hosts.read().unwrap().get(cp).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn test_port_lifecycle() {
        let inv = InMemoryInventory::new();
        let id = dev("of:01");
        inv.add_device(AccessDevice {
            id: id.clone(),
            serial: "OLT-001".to_string(),
        });
        inv.set_port(
            &id,
            AccessPort {
                number: PortNo::new(16),
                name: "BBSM0001-1".to_string(),
                enabled: true,
            },
        );

        let cp = ConnectPoint::new(id.clone(), PortNo::new(16));
        assert!(inv.port(&cp).unwrap().enabled);
        assert!(inv.is_available(&id));

        inv.remove_port(&cp);
        assert!(inv.port(&cp).is_none());
        assert_eq!(inv.ports(&id).len(), 0);
    }

    #[test]
    fn test_host_learning() {
        let inv = InMemoryInventory::new();
        let cp = ConnectPoint::new(dev("of:01"), PortNo::new(16));
        assert!(inv.connected_hosts(&cp).is_empty());

        inv.learn_host(
            cp.clone(),
            HostInfo {
                mac: MacAddr::new([0, 1, 2, 3, 4, 5]),
                vlan: VlanId::new(101).unwrap(),
            },
        );
        let hosts = inv.connected_hosts(&cp);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].vlan, VlanId::new(101).unwrap());
    }
}
