// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use subi_types::NetAddress;

/// Connection-manager id of a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Copy-out snapshot of one connection; the tier never holds live peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: NetAddress,
    pub protocol_version: i32,
    pub inbound: bool,
    /// Short-lived outbound connection opened for subinode traffic only.
    pub subinode_link: bool,
    pub successfully_connected: bool,
    /// Last block height this peer has in common with us, -1 when unknown.
    pub common_height: i64,
    /// Best header height the peer announced, -1 when unknown.
    pub sync_height: i64,
}

/// Snapshot access to the connection set.
pub trait PeerView: Send + Sync {
    fn peers(&self) -> Vec<PeerInfo>;
}

/// Peer view backed by an explicit list, for the daemon's connection
/// bookkeeping and for tests.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<Vec<PeerInfo>>,
}

impl PeerTable {
    pub fn set(&self, peers: Vec<PeerInfo>) {
        *self.peers.write() = peers;
    }

    pub fn upsert(&self, info: PeerInfo) {
        let mut peers = self.peers.write();
        match peers.iter_mut().find(|p| p.id == info.id) {
            Some(existing) => *existing = info,
            None => peers.push(info),
        }
    }

    pub fn remove(&self, id: PeerId) {
        self.peers.write().retain(|p| p.id != id);
    }
}

impl PeerView for PeerTable {
    fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64) -> PeerInfo {
        PeerInfo {
            id: PeerId(id),
            addr: "8.8.8.8:5335".parse().unwrap(),
            protocol_version: 70021,
            inbound: false,
            subinode_link: false,
            successfully_connected: true,
            common_height: -1,
            sync_height: -1,
        }
    }

    #[test]
    fn upsert_replaces_by_id() {
        let table = PeerTable::default();
        table.upsert(info(1));
        let mut updated = info(1);
        updated.common_height = 42;
        table.upsert(updated);
        let peers = table.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].common_height, 42);
    }

    #[test]
    fn remove_drops_peer() {
        let table = PeerTable::default();
        table.upsert(info(1));
        table.upsert(info(2));
        table.remove(PeerId(1));
        assert_eq!(table.peers().len(), 1);
    }
}
