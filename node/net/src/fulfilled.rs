// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use subi_types::NetAddress;

/// Per-peer "have we asked/answered this already" memory with expiry.
/// Purely a rate limiter for repeat traffic, never authoritative.
#[derive(Default)]
pub struct NetFulfilledRegistry {
    requests: RwLock<HashMap<NetAddress, HashMap<String, i64>>>,
}

/// How long a fulfilled request suppresses repeats by default.
pub const FULFILLED_REQUEST_EXPIRE_SECONDS: i64 = 3 * 60 * 60;

impl NetFulfilledRegistry {
    /// Mark `tag` fulfilled for `addr` until `now + FULFILLED_REQUEST_EXPIRE_SECONDS`.
    pub fn add(&self, addr: NetAddress, tag: &str, now: i64) {
        self.add_until(addr, tag, now + FULFILLED_REQUEST_EXPIRE_SECONDS);
    }

    pub fn add_until(&self, addr: NetAddress, tag: &str, expires_at: i64) {
        self.requests
            .write()
            .entry(addr)
            .or_default()
            .insert(tag.to_owned(), expires_at);
    }

    pub fn has(&self, addr: &NetAddress, tag: &str, now: i64) -> bool {
        self.requests
            .read()
            .get(addr)
            .and_then(|tags| tags.get(tag))
            .map(|expires_at| now < *expires_at)
            .unwrap_or(false)
    }

    pub fn remove(&self, addr: &NetAddress, tag: &str) {
        let mut requests = self.requests.write();
        if let Some(tags) = requests.get_mut(addr) {
            tags.remove(tag);
            if tags.is_empty() {
                requests.remove(addr);
            }
        }
    }

    /// Drop every entry whose expiry passed.
    pub fn expire_all(&self, now: i64) {
        let mut requests = self.requests.write();
        for tags in requests.values_mut() {
            tags.retain(|_, expires_at| now < *expires_at);
        }
        requests.retain(|_, tags| !tags.is_empty());
    }

    pub fn len(&self) -> usize {
        self.requests.read().values().map(|tags| tags.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    /// Snapshot for the manager dump file.
    pub fn export(&self) -> FulfilledDump {
        FulfilledDump {
            requests: self
                .requests
                .read()
                .iter()
                .map(|(addr, tags)| (*addr, tags.clone()))
                .collect(),
        }
    }

    pub fn import(&self, dump: FulfilledDump) {
        *self.requests.write() = dump.requests.into_iter().collect();
    }
}

/// Serializable form of the registry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FulfilledDump {
    pub requests: Vec<(NetAddress, HashMap<String, i64>)>,
}
