// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Device ownership across the cluster.  Every instance runs the same
//! weighted consistent hash over the same membership, so for any device
//! exactly one instance computes "mine" and acts on it; the others drop the
//! device's events and emit nothing southbound.

use std::collections::BTreeMap;

use slog::debug;

use common::ports::DeviceId;

use crate::cluster::NodeId;

/// Virtual tokens each node contributes to the ring.
pub const HASH_WEIGHT: usize = 10;

/// A weighted consistent-hash ring of cluster nodes.
///
/// The hash function must agree across every instance of the daemon, so this
/// uses 64-bit FNV-1a rather than the process-seeded std hasher.
pub struct ConsistentHasher {
    weight: usize,
    ring: BTreeMap<u64, NodeId>,
}

// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl ConsistentHasher {
    pub fn new(nodes: &[NodeId], weight: usize) -> Self {
        let mut hasher = ConsistentHasher { weight, ring: BTreeMap::new() };
        for node in nodes {
            hasher.add_server(node.clone());
        }
        hasher
    }

    pub fn add_server(&mut self, node: NodeId) {
        let tokens: Vec<u64> = (0..self.weight)
            .map(|i| fnv1a(format!("{node}-{i}").as_bytes()))
            .collect();
        for token in tokens {
            self.ring.insert(token, node.clone());
        }
    }

    pub fn remove_server(&mut self, node: &NodeId) {
        self.ring.retain(|_, n| n != node);
    }

    /// Map a key onto the ring: the first token clockwise from the key's
    /// hash owns it.  Returns `None` only when the ring is empty.
    pub fn hash(&self, key: &str) -> Option<&NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let h = fnv1a(key.as_bytes());
        self.ring
            .range(h..)
            .next()
            .map(|(_, n)| n)
            .or_else(|| self.ring.values().next())
    }

    pub fn node_count(&self) -> usize {
        self.ring.len() / self.weight.max(1)
    }
}

impl crate::Olt {
    /// Determines if this instance should handle this device, based on
    /// consistent hashing over the current membership.
    pub fn is_device_mine(&self, id: &DeviceId) -> bool {
        let local = self.cluster.local_node();
        let hasher = self.hasher.lock().unwrap();
        match hasher.hash(id.as_str()) {
            Some(owner) => {
                debug!(self.log, "device ownership computed";
                    "device" => %id, "owner" => %owner);
                *owner == local
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("node-{i}"))).collect()
    }

    #[test]
    fn test_empty_ring() {
        let h = ConsistentHasher::new(&[], HASH_WEIGHT);
        assert!(h.hash("of:0000000000000001").is_none());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ns = nodes(1);
        let h = ConsistentHasher::new(&ns, HASH_WEIGHT);
        for i in 0..64 {
            assert_eq!(h.hash(&format!("of:{i:016x}")), Some(&ns[0]));
        }
    }

    // The ownership computation is a pure function of membership: every
    // instance agrees on the owner of every device.
    #[test]
    fn test_ownership_is_deterministic() {
        let ns = nodes(3);
        let a = ConsistentHasher::new(&ns, HASH_WEIGHT);
        // built in a different insertion order
        let mut reversed = ns.clone();
        reversed.reverse();
        let b = ConsistentHasher::new(&reversed, HASH_WEIGHT);

        for i in 0..128 {
            let key = format!("of:{i:016x}");
            assert_eq!(a.hash(&key), b.hash(&key));
        }
    }

    #[test]
    fn test_every_node_gets_devices() {
        let ns = nodes(3);
        let h = ConsistentHasher::new(&ns, HASH_WEIGHT);
        let mut owners = std::collections::BTreeSet::new();
        for i in 0..256 {
            owners.insert(h.hash(&format!("of:{i:016x}")).unwrap().clone());
        }
        assert_eq!(owners.len(), 3);
    }

    // Removing a node remaps only the devices it owned.
    #[test]
    fn test_removal_is_minimal() {
        let ns = nodes(3);
        let mut h = ConsistentHasher::new(&ns, HASH_WEIGHT);

        let keys: Vec<String> =
            (0..256).map(|i| format!("of:{i:016x}")).collect();
        let before: Vec<NodeId> =
            keys.iter().map(|k| h.hash(k).unwrap().clone()).collect();

        h.remove_server(&ns[1]);
        assert_eq!(h.node_count(), 2);

        for (key, owner) in keys.iter().zip(before.iter()) {
            if *owner != ns[1] {
                assert_eq!(h.hash(key), Some(owner));
            } else {
                assert_ne!(h.hash(key), Some(&ns[1]));
            }
        }
    }
}
