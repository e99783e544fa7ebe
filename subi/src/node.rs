// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{Config, DecodeError, TierMessage};
use anyhow::Context;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use subi_active::{ActiveOptions, ActiveSubinode};
use subi_chain::{
    ChainView, Clock, EventBus, PaymentSchedule, SporkOracle, SyncStatus, TierEvent, WalletView,
};
use subi_net::{opcode, NetFulfilledRegistry, NetService, PeerInfo, PeerView, WirePayload};
use subi_payments::SubinodePayments;
use subi_subinode::{LocalIdentity, SubinodeManager};
use subi_subinode_sync::SubinodeSync;
use subi_types::BlockHeight;

/// External collaborators the tier consumes, all behind narrow traits.
pub struct TierDeps {
    pub chain: Arc<dyn ChainView>,
    pub clock: Arc<dyn Clock>,
    pub wallet: Arc<dyn WalletView>,
    pub sporks: Arc<dyn SporkOracle>,
    pub schedule: Arc<dyn PaymentSchedule>,
    pub peers: Arc<dyn PeerView>,
    pub net: NetService,
}

/// The process-wide tier container: every singleton lives here and is
/// passed by reference to handlers.
pub struct TierNode {
    pub identity: Arc<LocalIdentity>,
    pub status: Arc<SyncStatus>,
    pub fulfilled: Arc<NetFulfilledRegistry>,
    pub manager: Arc<SubinodeManager>,
    pub payments: Arc<SubinodePayments>,
    pub sync: Arc<SubinodeSync>,
    pub active: Arc<ActiveSubinode>,
    events: EventBus,
    events_rx: flume::Receiver<TierEvent>,
    clock: Arc<dyn Clock>,
    schedule: Arc<dyn PaymentSchedule>,
    net: NetService,
    data_dir: PathBuf,
}

impl TierNode {
    pub fn new(config: &Config, deps: TierDeps) -> anyhow::Result<TierNode> {
        let params = config.network.params();
        let (events, events_rx) = EventBus::new();
        let identity = Arc::new(LocalIdentity::default());
        let status = Arc::new(SyncStatus::default());
        let fulfilled = Arc::new(NetFulfilledRegistry::default());

        if config.subinode.enable {
            let secret = config
                .subinode
                .secret
                .as_deref()
                .context("subinode mode requires a service-node secret")?;
            let (key, pubkey) =
                subi_crypto::keys_from_secret(secret).context("invalid service-node secret")?;
            info!("running as a subinode, service key id {}", pubkey.key_id());
            identity.enable(key, pubkey);
        }

        let manager = Arc::new(SubinodeManager::new(
            deps.chain.clone(),
            deps.clock.clone(),
            params,
            deps.net.clone(),
            events.clone(),
            fulfilled.clone(),
            identity.clone(),
            status.clone(),
        ));
        let payments = Arc::new(SubinodePayments::new(
            manager.clone(),
            deps.chain.clone(),
            deps.clock.clone(),
            params,
            deps.net.clone(),
            events.clone(),
            fulfilled.clone(),
            identity.clone(),
            status.clone(),
            deps.sporks.clone(),
            deps.schedule.clone(),
        ));
        let sync = Arc::new(SubinodeSync::new(
            status.clone(),
            manager.clone(),
            payments.clone(),
            deps.chain.clone(),
            deps.clock.clone(),
            params,
            deps.net.clone(),
            fulfilled.clone(),
            deps.peers.clone(),
            identity.clone(),
        ));
        let active = Arc::new(ActiveSubinode::new(
            ActiveOptions {
                listening: true,
                external_addr: config.subinode.external_ip,
                collateral: config.subinode.collateral(),
            },
            identity.clone(),
            manager.clone(),
            deps.chain.clone(),
            deps.clock.clone(),
            params,
            deps.net.clone(),
            deps.wallet.clone(),
            deps.peers.clone(),
            status.clone(),
        ));

        Ok(TierNode {
            identity,
            status,
            fulfilled,
            manager,
            payments,
            sync,
            active,
            events,
            events_rx,
            clock: deps.clock,
            schedule: deps.schedule,
            net: deps.net,
            data_dir: config.data_dir(),
        })
    }

    /// Bus handle for the chain layer's tip notifications.
    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    // ---- persistence ------------------------------------------------------

    fn manager_dump_path(&self) -> PathBuf {
        self.data_dir.join("subinodes.dat")
    }

    fn payments_dump_path(&self) -> PathBuf {
        self.data_dir.join("payments.dat")
    }

    pub fn load_dumps(&self) {
        if self.manager.load(&self.manager_dump_path()) {
            info!("loaded {} subinodes from disk", self.manager.size());
        }
        if self.payments.load(&self.payments_dump_path()) {
            info!(
                "loaded {} payment votes from disk",
                self.payments.vote_count()
            );
        }
    }

    pub fn save_dumps(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.data_dir) {
            warn!("cannot create data dir {}: {e}", self.data_dir.display());
            return;
        }
        if let Err(e) = self.manager.dump(&self.manager_dump_path()) {
            warn!("failed to dump subinode list: {e}");
        }
        if let Err(e) = self.payments.dump(&self.payments_dump_path()) {
            warn!("failed to dump payment votes: {e}");
        }
    }

    // ---- inbound messages -------------------------------------------------

    /// Decode and route one inbound message. Unknown opcodes belong to the
    /// rest of the node; corrupt payloads get the sender banned.
    pub fn dispatch(&self, peer: &PeerInfo, op: &str, bytes: &[u8]) {
        match TierMessage::decode(op, bytes) {
            Ok(message) => self.handle(peer, message),
            Err(DecodeError::UnknownOpcode(_)) => {}
            Err(error @ DecodeError::Malformed { .. }) => {
                debug!("{error} from {}", peer.addr);
                self.net.misbehaving(peer.id, 100);
            }
        }
    }

    pub fn handle(&self, peer: &PeerInfo, message: TierMessage) {
        match message {
            TierMessage::Announce(announce) => {
                self.manager
                    .handle_announce(Some(peer), *announce, &*self.payments)
            }
            TierMessage::Ping(ping) => self.manager.handle_ping(Some(peer), ping, &*self.payments),
            TierMessage::Directory(filter) => self.manager.handle_directory(peer, filter),
            TierMessage::Verify(verify) => {
                self.manager.handle_verify(peer, verify, &*self.payments)
            }
            TierMessage::PaymentSync(count) => self.payments.handle_payment_sync(peer, count),
            TierMessage::PaymentVote(vote) => self.payments.handle_vote(Some(peer), vote),
            TierMessage::SyncStatusCount(item_id, count) => {
                self.sync.handle_sync_status_count(item_id, count)
            }
            TierMessage::GetSporks => {
                // Served by the spork collaborator, not the tier.
            }
        }
    }

    // ---- periodic work ----------------------------------------------------

    /// Route buffered observer events to their periodic consumers.
    pub fn drain_events(&self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                TierEvent::TipUpdated(height) => self.updated_block_tip(height),
                TierEvent::SubinodeListUpdated => self.sync.note_list_progress(),
                TierEvent::PaymentVoteAdded => self.sync.note_vote_progress(),
            }
        }
    }

    /// Fan the new-tip callback out to every component.
    pub fn updated_block_tip(&self, height: BlockHeight) {
        self.manager
            .updated_block_tip(height, &*self.payments, &*self.schedule);
        self.payments.updated_block_tip(height);
        self.sync.updated_block_tip();
        self.active.updated_block_tip();
    }

    /// Once per second.
    pub fn second_tick(&self) {
        self.drain_events();
        self.sync.process_tick();
    }

    /// Once per minute.
    pub fn minute_tick(&self) {
        self.manager.check_and_remove(&*self.payments);
        self.manager.do_full_verification_step(&*self.payments);
        self.payments.check_and_remove();
        self.active.manage(&*self.payments);
        self.fulfilled.expire_all(self.clock.now());
        self.open_scheduled_connections();
    }

    /// Open the connections the recovery logic queued up and ask each peer
    /// for the entries in question.
    fn open_scheduled_connections(&self) {
        while let Some((addr, outpoints)) = self.manager.pop_scheduled_connection() {
            let payloads: Vec<WirePayload> = outpoints
                .iter()
                .map(|outpoint| WirePayload::encode(opcode::DSEG, outpoint))
                .collect();
            debug!("opening recovery connection to {addr}");
            self.net.connect_and_send(addr, payloads);
        }
    }
}
