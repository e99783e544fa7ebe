// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::*;
use std::sync::Arc;
use subi_chain::test_util::{FlatSchedule, ManualClock, MemoryChain, StaticSporks};
use subi_chain::{EventBus, SyncStage, SyncStatus};
use subi_net::{NetworkMessage, PeerId, PeerInfo, PeerTable};
use subi_networks::Network;
use subi_types::BlockHeight;

const NOW: i64 = 1_700_000_000;

struct Harness {
    sync: SubinodeSync,
    chain: Arc<MemoryChain>,
    clock: Arc<ManualClock>,
    peers: Arc<PeerTable>,
    status: Arc<SyncStatus>,
    net_rx: flume::Receiver<NetworkMessage>,
}

fn peer(id: u64, height: BlockHeight) -> PeerInfo {
    PeerInfo {
        id: PeerId(id),
        addr: format!("8.8.8.{id}:5335").parse().unwrap(),
        protocol_version: 70021,
        inbound: false,
        subinode_link: false,
        successfully_connected: true,
        common_height: height,
        sync_height: height,
    }
}

fn harness() -> Harness {
    let chain = Arc::new(MemoryChain::with_tip(2000));
    chain.set_block_time(2000, NOW - 60);
    let clock = Arc::new(ManualClock::new(NOW));
    let (net, net_rx) = subi_net::NetService::pair();
    let (events, _events_rx) = EventBus::new();
    let status = Arc::new(SyncStatus::default());
    let fulfilled = Arc::new(subi_net::NetFulfilledRegistry::default());
    let identity = Arc::new(subi_subinode::LocalIdentity::default());
    let peers = Arc::new(PeerTable::default());
    let manager = Arc::new(subi_subinode::SubinodeManager::new(
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net.clone(),
        events.clone(),
        fulfilled.clone(),
        identity.clone(),
        status.clone(),
    ));
    let payments = Arc::new(subi_payments::SubinodePayments::new(
        manager.clone(),
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net.clone(),
        events,
        fulfilled.clone(),
        identity.clone(),
        status.clone(),
        Arc::new(StaticSporks::default()),
        Arc::new(FlatSchedule::default()),
    ));
    let sync = SubinodeSync::new(
        status.clone(),
        manager,
        payments,
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net,
        fulfilled,
        peers.clone(),
        identity,
    );
    Harness {
        sync,
        chain,
        clock,
        peers,
        status,
        net_rx,
    }
}

/// Run driver passes up to and including the next active (sixth) tick.
fn tick(h: &Harness) {
    for _ in 0..SYNC_TICK_SECONDS {
        h.sync.process_tick();
    }
}

fn sent_opcodes(rx: &flume::Receiver<NetworkMessage>) -> Vec<&'static str> {
    let mut opcodes = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let NetworkMessage::Send { payload, .. } = message {
            opcodes.push(payload.opcode);
        }
    }
    opcodes
}

#[test]
fn blockchain_synced_needs_a_peer_at_our_height() {
    let h = harness();
    assert!(!h.sync.is_blockchain_synced(false));

    h.clock.advance(SYNC_TICK_SECONDS);
    h.peers.set(vec![peer(1, 2000)]);
    assert!(h.sync.is_blockchain_synced(false));
    // Cached from now on.
    assert!(h.status.is_blockchain_synced());
}

#[test]
fn stuck_peers_do_not_count() {
    let h = harness();
    h.clock.advance(SYNC_TICK_SECONDS);
    h.peers.set(vec![peer(1, 500)]);
    assert!(!h.sync.is_blockchain_synced(false));
}

#[test]
fn long_suspension_resets_the_pipeline() {
    let h = harness();
    h.peers.set(vec![peer(1, 2000)]);
    h.clock.advance(SYNC_TICK_SECONDS);
    assert!(h.sync.is_blockchain_synced(false));
    h.status.set_stage(SyncStage::Winners);

    // The process slept for more than an hour.
    h.clock.advance(2 * 60 * 60);
    h.sync.is_blockchain_synced(false);
    assert_eq!(h.status.stage(), SyncStage::Initial);
}

#[test]
fn pipeline_advances_through_all_stages() {
    let h = harness();
    h.peers.set(vec![peer(1, 2000), peer(2, 2000)]);
    h.clock.advance(SYNC_TICK_SECONDS);
    assert!(h.sync.is_blockchain_synced(false));

    // Initial -> Sporks; sporks requested from the first peer.
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::Sporks);
    assert!(sent_opcodes(&h.net_rx).contains(&"getsporks"));

    // Sporks -> List; directory requested.
    h.clock.advance(SYNC_TICK_SECONDS);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::List);
    assert!(h.sync.attempt() >= 1);
    assert!(sent_opcodes(&h.net_rx).contains(&"dseg"));

    // Directory went quiet for the timeout window -> Winners.
    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::Winners);

    // Payment sync requested from both peers across ticks.
    h.clock.advance(SYNC_TICK_SECONDS);
    tick(&h);
    tick(&h);
    assert!(h.sync.attempt() >= 2);
    assert!(sent_opcodes(&h.net_rx).contains(&"mnget"));

    // Votes went quiet for the timeout window -> Finished.
    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::Finished);
    assert!(h.sync.is_synced(2000));
}

#[test]
fn list_timeout_with_no_peers_fails_then_recovers() {
    let h = harness();
    h.peers.set(vec![peer(1, 2000)]);
    h.clock.advance(SYNC_TICK_SECONDS);
    assert!(h.sync.is_blockchain_synced(false));

    // Reach the List stage without any peer able to serve it.
    tick(&h);
    h.clock.advance(SYNC_TICK_SECONDS);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::List);

    // The one peer's directory request is already burnt; with the attempt
    // counter back at zero (as on a fresh stage entry) the starved stage
    // must give up rather than advance.
    h.sync.reset();
    h.status.set_stage(SyncStage::List);
    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::Failed);
    assert!(h.sync.is_failed());

    // After the cooldown the driver starts over.
    h.clock.advance(SYNC_FAILURE_COOLDOWN_SECONDS + 1);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::Initial);
}

#[test]
fn progress_notes_keep_stages_alive() {
    let h = harness();
    h.peers.set(vec![peer(1, 2000)]);
    h.clock.advance(SYNC_TICK_SECONDS);
    h.sync.is_blockchain_synced(false);

    tick(&h);
    h.clock.advance(SYNC_TICK_SECONDS);
    tick(&h);
    assert_eq!(h.status.stage(), SyncStage::List);

    // Regular directory progress keeps List from timing out.
    for _ in 0..3 {
        h.clock.advance(SYNC_TIMEOUT_SECONDS - 5);
        h.sync.note_list_progress();
        tick(&h);
        assert_eq!(h.status.stage(), SyncStage::List);
    }
}

#[test]
fn sync_status_counts_are_informational() {
    let h = harness();
    // Must not panic or change state in any stage.
    h.sync.handle_sync_status_count(2, 17);
    h.status.set_stage(SyncStage::Finished);
    h.sync.handle_sync_status_count(3, 4);
    assert_eq!(h.status.stage(), SyncStage::Finished);
    let _ = h.chain.tip_height();
}
