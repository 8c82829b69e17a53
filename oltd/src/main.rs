// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `oltd`, the access-device provisioning
//! daemon.  Wires the reconciliation engine to its collaborators (southbound
//! driver, subscriber service, device inventory, cluster membership) and
//! runs the event pumps and the reconciliation worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::info;
use structopt::StructOpt;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::interval;
use tokio::time::Duration;

use common::logging::LogFormat;
use common::network::VlanId;
use common::ports::ConnectPoint;
use sbi::FlowOps;
use sbi::MeterOps;

use crate::cluster::ClusterMembership;
use crate::cluster::NodeId;
use crate::cluster::StaticCluster;
use crate::config::Config;
use crate::flow::FlowBuilder;
use crate::inventory::DeviceInventory;
use crate::inventory::InMemoryInventory;
use crate::meter_cache::MeterCache;
use crate::reconcile::MacWaiter;
use crate::reconcile::ReconcileTask;
use crate::service::AccessDeviceEvent;
use crate::sharding::ConsistentHasher;
use crate::sharding::HASH_WEIGHT;
use crate::southbound::SoftDriver;
use crate::status::StatusStore;
use crate::subscriber::StaticSubscribers;
use crate::subscriber::SubscriberLookup;

mod cluster;
mod config;
mod events;
mod flow;
mod flow_listener;
mod inventory;
mod meter_cache;
mod reconcile;
mod service;
mod sharding;
mod southbound;
mod status;
mod store;
mod subscriber;
#[cfg(test)]
mod testutil;
mod types;
mod views;

/// The application id stamped on every directive and checked on every
/// driver event.
pub const APP_NAME: &str = "oltd";

/// Size of the reconciliation worker pool.
const WORKER_COUNT: usize = 4;

#[derive(Debug, StructOpt)]
#[structopt(name = "oltd", about = "access-device provisioning daemon")]
pub(crate) struct Opt {
    /// File to which the log is written; stdout if unset
    #[structopt(long)]
    pub log_file: Option<String>,

    /// Log format: human or json
    #[structopt(long)]
    pub log_format: Option<LogFormat>,

    /// TOML file of provisioning knobs
    #[structopt(long)]
    pub config: Option<String>,

    /// JSON file of subscribers and bandwidth profiles
    #[structopt(long)]
    pub subscribers: Option<String>,

    /// This instance's cluster node id
    #[structopt(long, default_value = "local")]
    pub node_id: String,
}

/// The daemon: all component state, shared by the pumps, the worker pool
/// and the operator surface.
pub struct Olt {
    pub(crate) log: slog::Logger,
    pub(crate) config: Config,
    pub(crate) flow_builder: FlowBuilder,
    pub(crate) inventory: Arc<dyn DeviceInventory>,
    pub(crate) subscribers: Arc<dyn SubscriberLookup>,
    pub(crate) cluster: Arc<dyn ClusterMembership>,
    pub(crate) flows: Arc<dyn FlowOps>,
    pub(crate) meter_ops: Arc<dyn MeterOps>,
    pub(crate) status: StatusStore,
    pub(crate) meters: MeterCache,
    pub(crate) hasher: Mutex<ConsistentHasher>,
    pub(crate) tasks: mpsc::UnboundedSender<ReconcileTask>,
    pub(crate) access_events: broadcast::Sender<AccessDeviceEvent>,
    pub(crate) mac_waiters:
        Mutex<BTreeMap<(ConnectPoint, VlanId), Vec<MacWaiter>>>,
}

impl Olt {
    pub(crate) fn new(
        log: slog::Logger,
        config: Config,
        inventory: Arc<dyn DeviceInventory>,
        subscribers: Arc<dyn SubscriberLookup>,
        cluster: Arc<dyn ClusterMembership>,
        flows: Arc<dyn FlowOps>,
        meter_ops: Arc<dyn MeterOps>,
    ) -> (Arc<Olt>, mpsc::UnboundedReceiver<ReconcileTask>) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (access_events, _) = broadcast::channel(1024);
        let hasher =
            ConsistentHasher::new(&cluster.ready_nodes(), HASH_WEIGHT);
        let flow_builder =
            FlowBuilder::new(APP_NAME, config.default_tech_profile_id);
        let meters = MeterCache::new(
            &log,
            APP_NAME,
            Arc::clone(&subscribers),
            Arc::clone(&meter_ops),
            task_tx.clone(),
        );
        let status = StatusStore::new(&log);

        let olt = Arc::new(Olt {
            log,
            config,
            flow_builder,
            inventory,
            subscribers,
            cluster,
            flows,
            meter_ops,
            status,
            meters,
            hasher: Mutex::new(hasher),
            tasks: task_tx,
            access_events,
            mac_waiters: Mutex::new(BTreeMap::new()),
        });
        (olt, task_rx)
    }
}

fn signal_name(signal: c_int) -> &'static str {
    match signal {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGQUIT => "SIGQUIT",
        SIGTERM => "SIGTERM",
        _ => "unknown",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::from_args();
    let config =
        config::build_config(&opts).map_err(|e| anyhow!(e.to_string()))?;
    let log =
        common::logging::init("oltd", &config.log_file, config.log_format)?;

    let (sb_tx, sb_rx) = mpsc::unbounded_channel();
    let driver = Arc::new(SoftDriver::new(&log, sb_tx));
    let subscribers: Arc<dyn SubscriberLookup> = match &opts.subscribers {
        Some(path) => Arc::new(
            StaticSubscribers::from_file(path)
                .map_err(|e| anyhow!(e.to_string()))?,
        ),
        None => Arc::new(StaticSubscribers::new()),
    };
    let inventory = Arc::new(InMemoryInventory::new());
    let cluster =
        Arc::new(StaticCluster::new(NodeId::new(&opts.node_id)));

    let (olt, task_rx) = Olt::new(
        log.clone(),
        config,
        inventory,
        subscribers,
        cluster,
        Arc::clone(&driver) as Arc<dyn FlowOps>,
        Arc::clone(&driver) as Arc<dyn MeterOps>,
    );

    let task_rx = Arc::new(TokioMutex::new(task_rx));
    for _ in 0..WORKER_COUNT {
        tokio::spawn(events::reconcile_worker(
            Arc::clone(&olt),
            Arc::clone(&task_rx),
        ));
    }
    tokio::spawn(events::southbound_event_pump(Arc::clone(&olt), sb_rx));

    // these queues are the seams a device connector and a cluster
    // connector plug into
    let (device_events, device_rx) = mpsc::unbounded_channel();
    tokio::spawn(events::device_event_pump(Arc::clone(&olt), device_rx));
    let (cluster_events, cluster_rx) = mpsc::unbounded_channel();
    tokio::spawn(events::cluster_event_pump(Arc::clone(&olt), cluster_rx));

    {
        let mut rx = olt.access_events.subscribe();
        let log = log.clone();
        tokio::spawn(async move {
            while let Ok(ev) = rx.recv().await {
                info!(log, "access device event"; "kind" => ?ev.kind,
                    "device" => %ev.device, "port" => ?ev.port);
            }
        });
    }

    {
        let olt = Arc::clone(&olt);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                olt.prune_mac_waiters();
            }
        });
    }

    info!(log, "started"; "app" => APP_NAME,
        "node" => %olt.cluster.local_node());

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => info!(log, "ignoring {}", signal_name(signal)),
            _ => {
                info!(log, "exiting on {}", signal_name(signal));
                break;
            }
        }
    }

    drop(device_events);
    drop(cluster_events);
    Ok(())
}
