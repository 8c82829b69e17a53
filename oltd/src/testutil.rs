// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Fixtures for driving the reconciliation engine against the soft driver
//! and in-memory collaborators.

use std::sync::Arc;
use std::sync::Mutex;

use slog::Drain;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use common::network::VlanId;
use common::ports::ConnectPoint;
use common::ports::DeviceId;
use common::ports::PortNo;
use sbi::SouthboundEvent;

use crate::cluster::ClusterMembership;
use crate::cluster::NodeId;
use crate::config::Config;
use crate::inventory::AccessDevice;
use crate::inventory::AccessPort;
use crate::inventory::InMemoryInventory;
use crate::reconcile::ReconcileTask;
use crate::reconcile::TaskOutcome;
use crate::service::AccessDeviceEvent;
use crate::southbound::SoftDriver;
use crate::subscriber::BandwidthProfileInformation;
use crate::subscriber::StaticSubscribers;
use crate::subscriber::SubscriberInfo;
use crate::subscriber::UniTagInformation;
use crate::Olt;

pub(crate) fn test_log() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A membership whose node set tests can reshape.
pub(crate) struct TestCluster {
    local: NodeId,
    nodes: Mutex<Vec<NodeId>>,
}

impl TestCluster {
    pub fn new(local: &str, nodes: &[&str]) -> Self {
        TestCluster {
            local: NodeId::new(local),
            nodes: Mutex::new(
                nodes.iter().map(NodeId::new).collect(),
            ),
        }
    }
}

impl ClusterMembership for TestCluster {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().clone()
    }
}

pub(crate) struct Harness {
    pub olt: Arc<Olt>,
    pub driver: Arc<SoftDriver>,
    pub inventory: Arc<InMemoryInventory>,
    pub subscribers: Arc<StaticSubscribers>,
    pub sb_rx: mpsc::UnboundedReceiver<SouthboundEvent>,
    pub task_rx: mpsc::UnboundedReceiver<ReconcileTask>,
    pub events_rx: broadcast::Receiver<AccessDeviceEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Config::default(), TestCluster::new("n1", &["n1"]))
    }

    pub fn with_config(config: Config) -> Self {
        Self::build(config, TestCluster::new("n1", &["n1"]))
    }

    pub fn with_cluster(cluster: TestCluster) -> Self {
        Self::build(Config::default(), cluster)
    }

    fn build(config: Config, cluster: TestCluster) -> Self {
        let log = test_log();
        let (sb_tx, sb_rx) = mpsc::unbounded_channel();
        let driver = Arc::new(SoftDriver::new(&log, sb_tx));
        let inventory = Arc::new(InMemoryInventory::new());
        let subscribers = Arc::new(StaticSubscribers::new());

        let (olt, task_rx) = Olt::new(
            log,
            config,
            Arc::clone(&inventory) as Arc<dyn crate::inventory::DeviceInventory>,
            Arc::clone(&subscribers)
                as Arc<dyn crate::subscriber::SubscriberLookup>,
            Arc::new(cluster),
            Arc::clone(&driver) as Arc<dyn sbi::FlowOps>,
            Arc::clone(&driver) as Arc<dyn sbi::MeterOps>,
        );
        let events_rx = olt.access_events.subscribe();
        Harness {
            olt,
            driver,
            inventory,
            subscribers,
            sb_rx,
            task_rx,
            events_rx,
        }
    }

    /// Register an OLT with its uplink NNI port and OLT-level subscriber
    /// record, plus the default bandwidth profile.
    pub fn add_olt(&self, device: &str, serial: &str, uplink: u32) -> DeviceId {
        let id = DeviceId::new(device);
        self.inventory.add_device(AccessDevice {
            id: id.clone(),
            serial: serial.to_string(),
        });
        self.inventory.set_port(
            &id,
            AccessPort {
                number: PortNo::new(uplink),
                name: format!("nni-{uplink}"),
                enabled: true,
            },
        );
        self.subscribers.insert_subscriber(SubscriberInfo {
            id: serial.to_string(),
            uplink_port: Some(uplink),
            uni_tag_list: Vec::new(),
        });
        self.subscribers.insert_profile(profile("Default"));
        id
    }

    pub fn add_uni(
        &self,
        device: &DeviceId,
        port: u32,
        name: &str,
    ) -> ConnectPoint {
        self.inventory.set_port(
            device,
            AccessPort {
                number: PortNo::new(port),
                name: name.to_string(),
                enabled: true,
            },
        );
        ConnectPoint::new(device.clone(), PortNo::new(port))
    }

    /// Register a single-service HSIA subscriber on the named UNI.
    pub fn add_hsia_subscriber(&self, name: &str) -> UniTagInformation {
        let tag = hsia_tag();
        self.subscribers.insert_subscriber(SubscriberInfo {
            id: name.to_string(),
            uplink_port: None,
            uni_tag_list: vec![tag.clone()],
        });
        self.subscribers.insert_profile(profile("HSIA-US"));
        self.subscribers.insert_profile(profile("HSIA-DS"));
        tag
    }

    pub fn run(&self, task: ReconcileTask) -> TaskOutcome {
        self.olt.reconcile(task)
    }

    /// Deliver driver events and re-run queued tasks until nothing moves:
    /// what the pumps and the worker pool do in the running daemon.
    pub fn settle(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(ev) = self.sb_rx.try_recv() {
                self.olt.handle_southbound_event(ev);
                progressed = true;
            }
            if let Ok(task) = self.task_rx.try_recv() {
                self.olt.reconcile(task);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<AccessDeviceEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = self.events_rx.try_recv() {
            events.push(ev);
        }
        events
    }
}

pub(crate) fn profile(id: &str) -> BandwidthProfileInformation {
    BandwidthProfileInformation {
        id: id.to_string(),
        committed_information_rate: 100_000,
        committed_burst_size: 1000,
        exceeded_information_rate: 200_000,
        exceeded_burst_size: 2000,
        assured_information_rate: 50_000,
        assured_burst_size: 0,
    }
}

pub(crate) fn hsia_tag() -> UniTagInformation {
    UniTagInformation {
        pon_c_tag: VlanId::new(101).unwrap(),
        pon_s_tag: VlanId::new(7).unwrap(),
        uni_tag_match: VlanId::ANY,
        technology_profile_id: 64,
        is_dhcp_required: true,
        upstream_bandwidth_profile: Some("HSIA-US".to_string()),
        downstream_bandwidth_profile: Some("HSIA-DS".to_string()),
        service_name: "hsia".to_string(),
        ..Default::default()
    }
}
