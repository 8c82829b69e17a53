// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Cluster membership, as seen by this instance.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies one controller instance in the cluster.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl ToString) -> Self {
        NodeId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership changes delivered to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    InstanceReady(NodeId),
    InstanceDeactivated(NodeId),
}

/// Read access to cluster membership.
pub trait ClusterMembership: Send + Sync {
    /// This instance's node id.
    fn local_node(&self) -> NodeId;

    /// All nodes currently in READY state.
    fn ready_nodes(&self) -> Vec<NodeId>;
}

/// A fixed, single-node membership.  What the daemon runs with until a real
/// cluster connector is wired in.
pub struct StaticCluster {
    local: NodeId,
}

impl StaticCluster {
    pub fn new(local: NodeId) -> Self {
        StaticCluster { local }
    }
}

impl ClusterMembership for StaticCluster {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn ready_nodes(&self) -> Vec<NodeId> {
        vec![self.local.clone()]
    }
}
