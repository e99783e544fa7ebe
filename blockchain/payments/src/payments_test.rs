// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use subi_chain::test_util::{block_hash_for, FlatSchedule, ManualClock, MemoryChain, StaticSporks};
use subi_chain::{ChainView, Coin, EventBus, Spork, SyncStage, SyncStatus, TierEvent};
use subi_crypto::SecretKey;
use subi_net::{NetFulfilledRegistry, NetService, NetworkMessage, PeerId, PeerInfo};
use subi_networks::Network;
use subi_subinode::{
    LocalIdentity, PaymentsView, Ping, Subinode, SubinodeManager, SubinodeState,
};
use subi_types::{
    sha256d, BlockHeight, MsgSignature, OutPoint, PubKey, Script, Transaction, TxOut, COIN,
};

const NOW: i64 = 1_700_000_000;

struct Harness {
    manager: Arc<SubinodeManager>,
    payments: SubinodePayments,
    chain: Arc<MemoryChain>,
    clock: Arc<ManualClock>,
    identity: Arc<LocalIdentity>,
    sync: Arc<SyncStatus>,
    net_rx: flume::Receiver<NetworkMessage>,
    events_rx: flume::Receiver<TierEvent>,
}

fn harness_with_tip(tip: BlockHeight) -> Harness {
    let chain = Arc::new(MemoryChain::with_tip(tip));
    let clock = Arc::new(ManualClock::new(NOW));
    let (net, net_rx) = NetService::pair();
    let (events, events_rx) = EventBus::new();
    let identity = Arc::new(LocalIdentity::default());
    let sync = Arc::new(SyncStatus::default());
    sync.set_blockchain_synced(true);
    sync.set_stage(SyncStage::Finished);
    let fulfilled = Arc::new(NetFulfilledRegistry::default());
    let manager = Arc::new(SubinodeManager::new(
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net.clone(),
        events.clone(),
        fulfilled.clone(),
        identity.clone(),
        sync.clone(),
    ));
    let payments = SubinodePayments::new(
        manager.clone(),
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net,
        events,
        fulfilled,
        identity.clone(),
        sync.clone(),
        Arc::new(StaticSporks::with_active(&[Spork::PaymentEnforcement])),
        Arc::new(FlatSchedule::default()),
    );
    payments.updated_block_tip(tip);
    Harness {
        manager,
        payments,
        chain,
        clock,
        identity,
        sync,
        net_rx,
        events_rx,
    }
}

fn keypair(seed: u64) -> (SecretKey, PubKey) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    loop {
        let bytes: [u8; 32] = rng.gen();
        if let Ok(key) = SecretKey::parse(&bytes) {
            let public = subi_crypto::public_key(&key, true);
            return (key, public);
        }
    }
}

fn outpoint(tag: &[u8]) -> OutPoint {
    OutPoint::new(sha256d(tag).into(), 0)
}

/// An enabled record with a real service keypair, inserted directly.
fn keyed_node(h: &Harness, tag: &[u8], seed: u64, addr: &str) -> (OutPoint, SecretKey, PubKey) {
    let op = outpoint(tag);
    let (service_key, service_pub) = keypair(seed);
    let (_, collateral_pub) = keypair(seed + 500);
    h.chain.add_utxo(
        op,
        Coin {
            value: 10_000 * COIN,
            height: 10,
            script: Script::pay_to_key_id(&collateral_pub.key_id()),
        },
    );
    let tip = h.chain.tip_height().unwrap();
    let mut node = Subinode::new(
        addr.parse().unwrap(),
        op,
        collateral_pub,
        service_pub.clone(),
        70021,
        NOW - 86_400,
    );
    node.last_ping = Ping {
        outpoint: op,
        block_hash: block_hash_for(tip - 12),
        sig_time: NOW - 60,
        sig: MsgSignature(vec![1u8; 65]),
    };
    node.state = SubinodeState::Enabled;
    h.manager.add(node);
    (op, service_key, service_pub)
}

fn signed_vote(
    voter: OutPoint,
    height: BlockHeight,
    payee: &Script,
    key: &SecretKey,
    public: &PubKey,
) -> PaymentVote {
    let mut vote = PaymentVote::new(voter, height, payee.clone());
    assert!(vote.sign(key, public));
    vote
}

fn drain_broadcast_opcodes(rx: &flume::Receiver<NetworkMessage>) -> Vec<&'static str> {
    let mut opcodes = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let NetworkMessage::Broadcast { payload } = message {
            opcodes.push(payload.opcode);
        }
    }
    opcodes
}

#[test]
fn election_decides_transaction_validity() {
    let h = harness_with_tip(1100);
    let p1 = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    let p2 = Script::pay_to_key_id(&PubKey(vec![3u8; 33]).key_id());

    // Ten nodes vote at height 1000: seven for P1, three for P2.
    for i in 0..7u8 {
        assert!(h
            .payments
            .add_vote(&PaymentVote::new(outpoint(&[b'a', i]), 1000, p1.clone())));
    }
    for i in 0..3u8 {
        assert!(h
            .payments
            .add_vote(&PaymentVote::new(outpoint(&[b'b', i]), 1000, p2.clone())));
    }
    assert_eq!(h.payments.get_block_payee(1000), Some(p1.clone()));

    let total = 1000 * COIN;
    let payment = 300 * COIN; // three tenths under the flat schedule
    let pays_p1 = Transaction::new(vec![
        TxOut::new(total - payment, Script(vec![0x51])),
        TxOut::new(payment, p1),
    ]);
    let pays_p2 = Transaction::new(vec![
        TxOut::new(total - payment, Script(vec![0x51])),
        TxOut::new(payment, p2),
    ]);
    assert!(h.payments.is_transaction_valid(&pays_p1, 1000));
    assert!(!h.payments.is_transaction_valid(&pays_p2, 1000));
    // With payment enforcement active the losing chain is rejected.
    assert!(h.payments.is_block_payee_valid(&pays_p1, 1000));
    assert!(!h.payments.is_block_payee_valid(&pays_p2, 1000));
}

#[test]
fn no_data_means_no_objection() {
    let h = harness_with_tip(1100);
    let tx = Transaction::new(vec![TxOut::new(100, Script(vec![0x51]))]);
    assert!(h.payments.is_transaction_valid(&tx, 1000));
    // Below the payments start height everything is acceptable too.
    assert!(h.payments.is_block_payee_valid(&tx, 10));
}

#[test]
fn vote_window_boundaries() {
    let h = harness_with_tip(1000);
    let (op, key, public) = keyed_node(&h, b"voter", 1, "8.8.8.8:5335");
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());

    // tip + 20 is the last acceptable target height.
    let accepted = signed_vote(op, 1020, &payee, &key, &public);
    h.payments.handle_vote(None, accepted.clone());
    assert!(h.payments.has_verified_vote(&accepted.hash()));
    assert!(h
        .events_rx
        .try_iter()
        .any(|e| e == TierEvent::PaymentVoteAdded));

    // tip + 21 is rejected.
    let rejected = signed_vote(op, 1021, &payee, &key, &public);
    h.payments.handle_vote(None, rejected.clone());
    assert!(!h.payments.has_verified_vote(&rejected.hash()));
    assert_eq!(h.payments.get_block_payee(1021), None);
}

#[test]
fn one_vote_per_voter_per_height() {
    let h = harness_with_tip(1000);
    let (op, key, public) = keyed_node(&h, b"dup-voter", 2, "8.8.8.8:5335");
    let p1 = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    let p2 = Script::pay_to_key_id(&PubKey(vec![3u8; 33]).key_id());

    let first = signed_vote(op, 1010, &p1, &key, &public);
    h.payments.handle_vote(None, first.clone());
    assert!(h.payments.has_verified_vote(&first.hash()));

    // Accepting the identical vote twice is a no-op.
    h.payments.handle_vote(None, first.clone());
    assert_eq!(h.payments.vote_count(), 1);

    // A different payee from the same voter for the same height is dropped.
    let second = signed_vote(op, 1010, &p2, &key, &public);
    h.payments.handle_vote(None, second.clone());
    assert!(!h.payments.has_verified_vote(&second.hash()));
    assert_eq!(h.payments.get_block_payee(1010), Some(p1));
}

#[test]
fn forged_vote_is_not_stored() {
    let h = harness_with_tip(1000);
    let (op, _, _) = keyed_node(&h, b"honest", 3, "8.8.8.8:5335");
    let (intruder_key, intruder_pub) = keypair(99);
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());

    let forged = signed_vote(op, 1010, &payee, &intruder_key, &intruder_pub);
    h.payments.handle_vote(None, forged.clone());
    assert!(!h.payments.has_verified_vote(&forged.hash()));
}

#[test]
fn vote_from_unknown_voter_asks_the_sender() {
    let h = harness_with_tip(1000);
    let (_, key, public) = keyed_node(&h, b"known", 4, "8.8.8.8:5335");
    let stranger = outpoint(b"stranger");
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    let sender = PeerInfo {
        id: PeerId(11),
        addr: "7.7.7.7:5335".parse().unwrap(),
        protocol_version: 70021,
        inbound: false,
        subinode_link: false,
        successfully_connected: true,
        common_height: 1000,
        sync_height: 1000,
    };

    let vote = signed_vote(stranger, 1010, &payee, &key, &public);
    h.payments.handle_vote(Some(&sender), vote);

    let mut asked = false;
    while let Ok(message) = h.net_rx.try_recv() {
        if let NetworkMessage::Send { peer, payload } = message {
            if payload.opcode == "dseg" {
                assert_eq!(peer, PeerId(11));
                asked = true;
            }
        }
    }
    assert!(asked);
}

#[test]
fn fill_block_payee_falls_back_to_the_queue() {
    let h = harness_with_tip(1000);
    let (op, _, _) = keyed_node(&h, b"queued", 5, "8.8.8.8:5335");

    let out = h.payments.fill_block_payee(1000, 300 * COIN).unwrap();
    let expected = h.manager.info(&op).unwrap().payee();
    assert_eq!(out, TxOut::new(300 * COIN, expected));
}

#[test]
fn process_block_votes_and_relays() {
    let h = harness_with_tip(1000);

    // We are an active subinode ranked in the top ten.
    let (our_op, our_key, our_pub) = keyed_node(&h, b"ourselves", 6, "8.8.4.4:5335");
    h.identity.enable(our_key, our_pub);
    h.identity.set_endpoint(our_op, "8.8.4.4:5335".parse().unwrap());
    let (target_op, _, _) = keyed_node(&h, b"payee-node", 7, "8.8.8.8:5335");

    assert!(h.payments.process_block(1000));
    assert_eq!(h.payments.vote_count(), 1);
    let winner = h.payments.get_block_payee(1000).unwrap();
    let candidates = [
        h.manager.info(&our_op).unwrap().payee(),
        h.manager.info(&target_op).unwrap().payee(),
    ];
    assert!(candidates.contains(&winner));
    assert_eq!(drain_broadcast_opcodes(&h.net_rx), vec!["mnw"]);
}

#[test]
fn storage_window_eviction() {
    let h = harness_with_tip(6000);
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());

    assert_eq!(h.payments.storage_limit(), 5000);
    assert!(h
        .payments
        .add_vote(&PaymentVote::new(outpoint(b"old"), 500, payee.clone())));
    assert!(h
        .payments
        .add_vote(&PaymentVote::new(outpoint(b"new"), 2000, payee)));
    assert_eq!(h.payments.block_count(), 2);

    h.payments.check_and_remove();
    assert_eq!(h.payments.block_count(), 1);
    assert_eq!(h.payments.vote_count(), 1);
    assert!(h.payments.get_block_payee(500).is_none());
    assert!(h.payments.get_block_payee(2000).is_some());
}

#[test]
fn enough_data_requires_a_full_window() {
    let h = harness_with_tip(1000);
    assert!(!h.payments.is_enough_data());
}

#[test]
fn dump_and_load_round_trip() {
    let h = harness_with_tip(1000);
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    let vote = PaymentVote::new(outpoint(b"persisted"), 990, payee.clone());
    assert!(h.payments.add_vote(&vote));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payments.dat");
    h.payments.dump(&path).unwrap();

    let restored = harness_with_tip(1000);
    assert!(restored.payments.load(&path));
    assert_eq!(restored.payments.vote_count(), 1);
    assert_eq!(restored.payments.get_block_payee(990), Some(payee));
}

#[test]
fn votes_ignored_until_list_synced() {
    let h = harness_with_tip(1000);
    h.sync.set_stage(SyncStage::List);
    let (op, key, public) = keyed_node(&h, b"early-voter", 8, "8.8.8.8:5335");
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    let vote = signed_vote(op, 1010, &payee, &key, &public);
    h.payments.handle_vote(None, vote.clone());
    assert_eq!(h.payments.vote_count(), 0);
}

#[test]
fn scheduled_payees_are_reported() {
    let h = harness_with_tip(1000);
    let payee = Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id());
    // Elected within the lookahead window.
    assert!(h
        .payments
        .add_vote(&PaymentVote::new(outpoint(b"sched"), 1004, payee.clone())));
    assert!(h.payments.is_scheduled(&payee, 0));
    // The skipped height does not count.
    assert!(!h.payments.is_scheduled(&payee, 1004));
}
