// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::*;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use subi_chain::test_util::{block_hash_for, ManualClock, MemoryChain};
use subi_chain::{Coin, Collateral, EventBus, SyncStage, SyncStatus, WalletView};
use subi_crypto::SecretKey;
use subi_net::{NetFulfilledRegistry, NetService, NetworkMessage, PeerTable};
use subi_networks::Network;
use subi_subinode::{PaymentsView, Ping, Subinode, SubinodeManager, SubinodeState};
use subi_types::{
    sha256d, Amount, BlockHeight, MsgSignature, OutPoint, PubKey, Script, COIN,
};

const NOW: i64 = 1_700_000_000;

struct TestPayments;

impl PaymentsView for TestPayments {
    fn min_payments_proto(&self) -> i32 {
        70020
    }
    fn is_scheduled(&self, _payee: &Script, _skip_height: BlockHeight) -> bool {
        false
    }
    fn has_payee_with_votes(
        &self,
        _height: BlockHeight,
        _payee: &Script,
        _min_votes: usize,
    ) -> bool {
        false
    }
    fn storage_limit(&self) -> i64 {
        5000
    }
}

struct TestWallet {
    locked: bool,
    balance: Amount,
    collateral: Option<(OutPoint, PubKey, [u8; 32])>,
    locked_coins: RwLock<Vec<OutPoint>>,
}

impl TestWallet {
    fn empty() -> Self {
        TestWallet {
            locked: false,
            balance: 0,
            collateral: None,
            locked_coins: RwLock::new(Vec::new()),
        }
    }

    fn with_collateral(outpoint: OutPoint, pubkey: PubKey, secret: &SecretKey) -> Self {
        TestWallet {
            locked: false,
            balance: 10_000 * COIN,
            collateral: Some((outpoint, pubkey, secret.serialize())),
            locked_coins: RwLock::new(Vec::new()),
        }
    }
}

impl WalletView for TestWallet {
    fn is_locked(&self) -> bool {
        self.locked
    }

    fn balance(&self) -> Amount {
        self.balance
    }

    fn find_collateral(&self, filter: Option<OutPoint>) -> Option<Collateral> {
        let (outpoint, pubkey, secret) = self.collateral.as_ref()?;
        if filter.map(|f| f != *outpoint).unwrap_or(false) {
            return None;
        }
        Some(Collateral {
            outpoint: *outpoint,
            pubkey: pubkey.clone(),
            secret: SecretKey::parse(secret).expect("stored secret is valid"),
        })
    }

    fn lock_coin(&self, outpoint: &OutPoint) {
        self.locked_coins.write().push(*outpoint);
    }
}

struct Harness {
    active: ActiveSubinode,
    manager: Arc<SubinodeManager>,
    chain: Arc<MemoryChain>,
    clock: Arc<ManualClock>,
    identity: Arc<subi_subinode::LocalIdentity>,
    sync: Arc<SyncStatus>,
    net_rx: flume::Receiver<NetworkMessage>,
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

fn harness(wallet: TestWallet, external_addr: Option<&str>, service_node: bool) -> Harness {
    let chain = Arc::new(MemoryChain::with_tip(100));
    let clock = Arc::new(ManualClock::new(NOW));
    let (net, net_rx) = NetService::pair();
    let (events, _events_rx) = EventBus::new();
    let identity = Arc::new(subi_subinode::LocalIdentity::default());
    if service_node {
        let (service_key, service_pub) = keypair(1);
        identity.enable(service_key, service_pub);
    }
    let sync = Arc::new(SyncStatus::default());
    sync.set_blockchain_synced(true);
    sync.set_stage(SyncStage::Finished);
    let fulfilled = Arc::new(NetFulfilledRegistry::default());
    let manager = Arc::new(SubinodeManager::new(
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net.clone(),
        events,
        fulfilled,
        identity.clone(),
        sync.clone(),
    ));
    let active = ActiveSubinode::new(
        ActiveOptions {
            listening: true,
            external_addr: external_addr.map(|s| s.parse().unwrap()),
            collateral: None,
        },
        identity.clone(),
        manager.clone(),
        chain.clone(),
        clock.clone(),
        Network::Mainnet.params(),
        net,
        Arc::new(wallet),
        Arc::new(PeerTable::default()),
        sync.clone(),
    );
    Harness {
        active,
        manager,
        chain,
        clock,
        identity,
        sync,
        net_rx,
    }
}

fn broadcast_opcodes(rx: &flume::Receiver<NetworkMessage>) -> Vec<&'static str> {
    let mut opcodes = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let NetworkMessage::Broadcast { payload } = message {
            opcodes.push(payload.opcode);
        }
    }
    opcodes
}

#[test]
fn regular_nodes_do_nothing() {
    let h = harness(TestWallet::empty(), Some("8.8.8.8:5335"), false);
    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::Initial);
    assert!(h.net_rx.try_recv().is_err());
}

#[test]
fn waits_for_blockchain_sync() {
    let h = harness(TestWallet::empty(), Some("8.8.8.8:5335"), true);
    h.sync.set_blockchain_synced(false);
    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::SyncInProcess);
}

#[test]
fn missing_external_address_is_not_capable() {
    let h = harness(TestWallet::empty(), None, true);
    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::NotCapable);
}

#[test]
fn wrong_port_is_not_capable() {
    let h = harness(TestWallet::empty(), Some("8.8.8.8:15335"), true);
    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::NotCapable);
    assert!(h.active.status_text().contains("Invalid port"));
}

#[test]
fn local_start_announces_and_pings() {
    let (collateral_key, collateral_pub) = keypair(2);
    let op = OutPoint::new(sha256d(b"our-collateral").into(), 0);
    let wallet = TestWallet::with_collateral(op, collateral_pub.clone(), &collateral_key);
    let h = harness(wallet, Some("8.8.8.8:5335"), true);
    h.chain.add_utxo(
        op,
        Coin {
            value: 10_000 * COIN,
            height: 50,
            script: Script::pay_to_key_id(&collateral_pub.key_id()),
        },
    );

    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::Started);
    assert_eq!(h.active.kind(), ActiveKind::Local);
    assert_eq!(h.active.outpoint(), op);
    assert_eq!(h.identity.outpoint(), op);
    assert_eq!(h.manager.size(), 1);
    assert_eq!(broadcast_opcodes(&h.net_rx), vec!["mnb"]);

    // The announce's embedded ping is fresh, so no extra ping goes out yet.
    h.active.manage(&TestPayments);
    assert!(broadcast_opcodes(&h.net_rx).is_empty());

    // After the ping interval the pinger kicks in.
    h.clock.advance(subi_subinode::MIN_PING_SECONDS + 1);
    h.active.manage(&TestPayments);
    assert_eq!(broadcast_opcodes(&h.net_rx), vec!["mnp"]);
    let node = h.manager.get(&op).unwrap();
    assert_eq!(node.last_ping.sig_time, h.clock.now());
}

#[test]
fn shallow_collateral_is_input_too_new() {
    let (collateral_key, collateral_pub) = keypair(3);
    let op = OutPoint::new(sha256d(b"fresh-collateral").into(), 0);
    let wallet = TestWallet::with_collateral(op, collateral_pub.clone(), &collateral_key);
    let h = harness(wallet, Some("8.8.8.8:5335"), true);
    h.chain.add_utxo(
        op,
        Coin {
            value: 10_000 * COIN,
            height: 95,
            script: Script::pay_to_key_id(&collateral_pub.key_id()),
        },
    );

    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::InputTooNew);
    assert!(h.active.status_text().contains("confirmations"));
}

#[test]
fn remote_start_resumes_an_existing_record() {
    let h = harness(TestWallet::empty(), Some("8.8.8.8:5335"), true);
    let op = OutPoint::new(sha256d(b"remote-collateral").into(), 0);
    h.chain.add_utxo(
        op,
        Coin {
            value: 10_000 * COIN,
            height: 50,
            script: Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id()),
        },
    );
    let mut node = Subinode::new(
        "8.8.8.8:5335".parse().unwrap(),
        op,
        PubKey(vec![2u8; 33]),
        h.identity.service_pubkey(),
        70021,
        NOW - 7200,
    );
    node.last_ping = Ping {
        outpoint: op,
        block_hash: block_hash_for(88),
        sig_time: NOW - 60,
        sig: MsgSignature(vec![1u8; 65]),
    };
    node.state = SubinodeState::Enabled;
    h.manager.add(node);

    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::Started);
    assert_eq!(h.active.kind(), ActiveKind::Remote);
    assert_eq!(h.identity.outpoint(), op);
}

#[test]
fn remote_record_with_foreign_address_is_not_capable() {
    let h = harness(TestWallet::empty(), Some("8.8.8.8:5335"), true);
    let op = OutPoint::new(sha256d(b"misplaced").into(), 0);
    h.chain.add_utxo(
        op,
        Coin {
            value: 10_000 * COIN,
            height: 50,
            script: Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id()),
        },
    );
    let mut node = Subinode::new(
        "9.9.9.9:5335".parse().unwrap(),
        op,
        PubKey(vec![2u8; 33]),
        h.identity.service_pubkey(),
        70021,
        NOW - 7200,
    );
    node.state = SubinodeState::Enabled;
    h.manager.add(node);

    h.active.manage(&TestPayments);
    assert_eq!(h.active.state(), ActiveState::NotCapable);
    assert!(h.active.status_text().contains("doesn't match"));
}
