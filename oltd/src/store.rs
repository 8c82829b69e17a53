// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The in-process mirror of a cluster-replicated map.
//!
//! The contract the rest of the daemon relies on is small: a mapping from K
//! to V with linearisable put/get/remove, and a compare-and-update operation
//! (`compute`) so that concurrent writers merge rather than clobber.  The
//! underlying replication layer owns cross-node coherence; everything stored
//! here must therefore remain serialisable with a stable wire format, which
//! the serde bounds enforce at compile time.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::debug;

pub struct ReplicatedMap<K, V> {
    log: slog::Logger,
    data: RwLock<BTreeMap<K, V>>,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(log: &slog::Logger, name: &'static str) -> Self {
        let log = log.new(slog::o!("map" => name));
        debug!(log, "created replicated map");
        ReplicatedMap { log, data: RwLock::new(BTreeMap::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.data.write().unwrap().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.data.write().unwrap().remove(key)
    }

    /// Atomically replace the value under `key` with `f(current)`.
    /// Returning `None` from `f` removes the entry.  The closure runs under
    /// the exclusive lock, so concurrent `compute` calls serialise.
    pub fn compute<F>(&self, key: &K, f: F) -> Option<V>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let mut data = self.data.write().unwrap();
        let current = data.get(key).cloned();
        match f(current) {
            Some(next) => {
                data.insert(key.clone(), next.clone());
                Some(next)
            }
            None => {
                data.remove(key);
                None
            }
        }
    }

    /// A point-in-time snapshot of every entry.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.data
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drop every entry failing the predicate, returning what was removed.
    pub fn drain_filter<F>(&self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut data = self.data.write().unwrap();
        let gone: Vec<(K, V)> = data
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, _) in &gone {
            data.remove(k);
        }
        if !gone.is_empty() {
            debug!(self.log, "dropped {} entries", gone.len());
        }
        gone
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }
}
