// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::PeerId;
use log::debug;
use serde::Serialize;
use subi_types::{Inv, NetAddress};

/// Wire opcodes of the tier subsystem, as they appear on the wire.
pub mod opcode {
    /// Subinode announce.
    pub const MNANNOUNCE: &str = "mnb";
    /// Subinode ping.
    pub const MNPING: &str = "mnp";
    /// Directory request (optionally filtered to one outpoint).
    pub const DSEG: &str = "dseg";
    /// Proof-of-service verification request/reply/broadcast.
    pub const MNVERIFY: &str = "mnv";
    /// Payment vote sync request.
    pub const MNGET: &str = "mnget";
    /// Payment vote.
    pub const MNWINNER: &str = "mnw";
    /// Sync status count.
    pub const SYNCSTATUSCOUNT: &str = "ssc";
    /// Spork inventory request (handled by the spork collaborator).
    pub const GETSPORKS: &str = "getsporks";
}

/// Sync item ids carried inside `ssc` messages.
pub const SYNC_ITEM_LIST: i32 = 2;
pub const SYNC_ITEM_MNW: i32 = 3;

/// An opcode plus its bincode-encoded payload, ready for the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WirePayload {
    pub opcode: &'static str,
    pub bytes: Vec<u8>,
}

impl WirePayload {
    pub fn encode<T: Serialize>(opcode: &'static str, value: &T) -> Self {
        let bytes = bincode::serialize(value).expect("in-memory serialization cannot fail");
        WirePayload { opcode, bytes }
    }
}

/// Commands the tier issues to the P2P layer. Consumed by the connection
/// manager outside of any store lock.
#[derive(Clone, Debug)]
pub enum NetworkMessage {
    /// Send a message to one peer.
    Send {
        peer: PeerId,
        payload: WirePayload,
    },
    /// Relay a record to every connected peer.
    Broadcast { payload: WirePayload },
    /// Ask a peer for inventory items (GETDATA).
    FetchInventory { peer: PeerId, invs: Vec<Inv> },
    /// Raise the misbehavior score of a peer.
    Misbehaving { peer: PeerId, score: u32 },
    /// Drop the connection to a peer.
    Disconnect { peer: PeerId },
    /// Open an outbound connection and send each payload.
    ConnectAndSend {
        addr: NetAddress,
        payloads: Vec<WirePayload>,
    },
}

/// Cloneable handle used by the tier components to reach the P2P layer.
/// Sends never block; a full or disconnected channel only logs.
#[derive(Clone)]
pub struct NetService {
    sender: flume::Sender<NetworkMessage>,
}

impl NetService {
    pub fn new(sender: flume::Sender<NetworkMessage>) -> Self {
        NetService { sender }
    }

    /// Channel pair for wiring a consumer, used by the daemon and tests.
    pub fn pair() -> (NetService, flume::Receiver<NetworkMessage>) {
        let (sender, receiver) = flume::unbounded();
        (NetService::new(sender), receiver)
    }

    fn push(&self, message: NetworkMessage) {
        if self.sender.send(message).is_err() {
            debug!("network receiver dropped, message discarded");
        }
    }

    pub fn send_to<T: Serialize>(&self, peer: PeerId, opcode: &'static str, value: &T) {
        self.push(NetworkMessage::Send {
            peer,
            payload: WirePayload::encode(opcode, value),
        });
    }

    pub fn broadcast<T: Serialize>(&self, opcode: &'static str, value: &T) {
        self.push(NetworkMessage::Broadcast {
            payload: WirePayload::encode(opcode, value),
        });
    }

    pub fn fetch_inventory(&self, peer: PeerId, invs: Vec<Inv>) {
        if invs.is_empty() {
            return;
        }
        self.push(NetworkMessage::FetchInventory { peer, invs });
    }

    pub fn misbehaving(&self, peer: PeerId, score: u32) {
        if score == 0 {
            return;
        }
        self.push(NetworkMessage::Misbehaving { peer, score });
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.push(NetworkMessage::Disconnect { peer });
    }

    pub fn connect_and_send(&self, addr: NetAddress, payloads: Vec<WirePayload>) {
        self.push(NetworkMessage::ConnectAndSend { addr, payloads });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_encodes_payload() {
        let (net, rx) = NetService::pair();
        net.send_to(PeerId(4), opcode::MNGET, &10i32);
        match rx.try_recv().unwrap() {
            NetworkMessage::Send { peer, payload } => {
                assert_eq!(peer, PeerId(4));
                assert_eq!(payload.opcode, "mnget");
                let count: i32 = bincode::deserialize(&payload.bytes).unwrap();
                assert_eq!(count, 10);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn zero_misbehaving_is_suppressed() {
        let (net, rx) = NetService::pair();
        net.misbehaving(PeerId(1), 0);
        net.misbehaving(PeerId(1), 33);
        match rx.try_recv().unwrap() {
            NetworkMessage::Misbehaving { score, .. } => assert_eq!(score, 33),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (net, rx) = NetService::pair();
        drop(rx);
        net.broadcast(opcode::MNPING, &1u8);
    }
}
