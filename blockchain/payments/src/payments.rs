// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{
    BlockPayees, PaymentVote, FUTURE_VOTE_BLOCKS, MIN_PAYMENT_PROTO_VERSION_1,
    MIN_PAYMENT_PROTO_VERSION_2, MNPAYMENTS_SIGNATURES_REQUIRED, MNPAYMENTS_SIGNATURES_TOTAL,
    SCHEDULED_BLOCKS_AHEAD,
};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use subi_chain::{
    ChainView, Clock, EventBus, PaymentSchedule, Spork, SporkOracle, SyncStatus, TierEvent,
};
use subi_net::{opcode, NetFulfilledRegistry, NetService, PeerInfo, SYNC_ITEM_MNW};
use subi_networks::ChainParams;
use subi_subinode::{store, LocalIdentity, PaymentsView, Rejected, SubinodeManager};
use subi_types::{
    Amount, BlockHeight, Hash256, Inv, InvKind, OutPoint, Script, Transaction, TxOut, MAX_INV_SIZE,
};

const SERIALIZATION_VERSION: &str = "SubinodePayments-v2";

/// Vote history kept for at least this many heights.
const MIN_BLOCKS_TO_STORE: i64 = 5000;

/// Everything behind the single payments lock: votes, buckets and the
/// per-voter dedup all change together.
#[derive(Default)]
struct PaymentsInner {
    votes: HashMap<Hash256, PaymentVote>,
    blocks: BTreeMap<BlockHeight, BlockPayees>,
    last_votes: HashMap<OutPoint, BlockHeight>,
    tip_height: Option<BlockHeight>,
}

/// Keeps track of who should get paid on which blocks.
pub struct SubinodePayments {
    inner: RwLock<PaymentsInner>,
    manager: Arc<SubinodeManager>,
    chain: Arc<dyn ChainView>,
    clock: Arc<dyn Clock>,
    params: &'static ChainParams,
    net: NetService,
    events: EventBus,
    fulfilled: Arc<NetFulfilledRegistry>,
    identity: Arc<LocalIdentity>,
    sync: Arc<SyncStatus>,
    sporks: Arc<dyn SporkOracle>,
    schedule: Arc<dyn PaymentSchedule>,
}

impl SubinodePayments {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<SubinodeManager>,
        chain: Arc<dyn ChainView>,
        clock: Arc<dyn Clock>,
        params: &'static ChainParams,
        net: NetService,
        events: EventBus,
        fulfilled: Arc<NetFulfilledRegistry>,
        identity: Arc<LocalIdentity>,
        sync: Arc<SyncStatus>,
        sporks: Arc<dyn SporkOracle>,
        schedule: Arc<dyn PaymentSchedule>,
    ) -> Self {
        SubinodePayments {
            inner: RwLock::new(PaymentsInner::default()),
            manager,
            chain,
            clock,
            params,
            net,
            events,
            fulfilled,
            identity,
            sync,
            sporks,
            schedule,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.votes.clear();
        inner.blocks.clear();
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn vote_count(&self) -> usize {
        self.inner.read().votes.len()
    }

    /// A node may cast one vote per target height; the first one wins.
    pub fn can_vote(&self, voter: &OutPoint, height: BlockHeight) -> bool {
        let mut inner = self.inner.write();
        if inner.last_votes.get(voter) == Some(&height) {
            return false;
        }
        inner.last_votes.insert(*voter, height);
        true
    }

    pub fn has_verified_vote(&self, hash: &Hash256) -> bool {
        self.inner
            .read()
            .votes
            .get(hash)
            .map(PaymentVote::is_verified)
            .unwrap_or(false)
    }

    /// Store a vote and its bucket entry. The caller has already validated
    /// rank, signature and dedup.
    pub fn add_vote(&self, vote: &PaymentVote) -> bool {
        if self
            .chain
            .block_hash(vote.block_height - 100)
            .is_none()
        {
            warn!(
                "no block hash at height {} for payment vote",
                vote.block_height - 100
            );
            return false;
        }
        if self.has_verified_vote(&vote.hash()) {
            return false;
        }

        let mut inner = self.inner.write();
        inner.votes.insert(vote.hash(), vote.clone());
        inner
            .blocks
            .entry(vote.block_height)
            .or_insert_with(|| BlockPayees::new(vote.block_height))
            .add_vote(vote);
        true
    }

    /// Elected payee for a height, once any vote exists.
    pub fn get_block_payee(&self, height: BlockHeight) -> Option<Script> {
        self.inner
            .read()
            .blocks
            .get(&height)
            .and_then(BlockPayees::best_payee)
    }

    /// Whether `payee` is already elected in the payment lookahead window.
    pub fn is_scheduled_payee(&self, payee: &Script, skip_height: BlockHeight) -> bool {
        let inner = self.inner.read();
        let Some(tip) = inner.tip_height else {
            return false;
        };
        for height in tip..=tip + SCHEDULED_BLOCKS_AHEAD {
            if height == skip_height {
                continue;
            }
            if let Some(block) = inner.blocks.get(&height) {
                if block.best_payee().as_ref() == Some(payee) {
                    return true;
                }
            }
        }
        false
    }

    /// Per-height transaction check; no data means no objection.
    pub fn is_transaction_valid(&self, tx: &Transaction, height: BlockHeight) -> bool {
        let inner = self.inner.read();
        match inner.blocks.get(&height) {
            Some(block) => block.is_transaction_valid(tx, &*self.schedule),
            None => true,
        }
    }

    /// Consensus-facing payee check: before enforcement starts (low heights,
    /// incomplete sync, enforcement spork off) every chain is acceptable.
    pub fn is_block_payee_valid(&self, tx: &Transaction, height: BlockHeight) -> bool {
        if height < self.params.payments_start_block {
            return true;
        }
        let tip = self.chain.tip_height().unwrap_or_default();
        if !self.sync.is_synced(tip) {
            // No vote data to check anything against, accept the chain.
            return true;
        }
        if self.is_transaction_valid(tx, height) {
            return true;
        }
        if self.sporks.is_active(Spork::PaymentEnforcement) {
            return false;
        }
        debug!("payment enforcement is disabled, accepting block at height {height}");
        true
    }

    /// Payee output for a block template: the elected payee, or the local
    /// queue computation when the election is still undecided.
    pub fn fill_block_payee(&self, height: BlockHeight, payment: Amount) -> Option<TxOut> {
        let payee = match self.get_block_payee(height) {
            Some(payee) => payee,
            None => {
                let (winner, _) = self.manager.next_in_queue_for_payment(height, true, self);
                match winner {
                    Some(info) => info.payee(),
                    None => {
                        debug!("failed to detect a subinode to pay at height {height}");
                        return None;
                    }
                }
            }
        };
        Some(TxOut::new(payment, payee))
    }

    pub fn required_payments_string(&self, height: BlockHeight) -> String {
        self.inner
            .read()
            .blocks
            .get(&height)
            .map(BlockPayees::required_payments_string)
            .unwrap_or_else(|| "Unknown".to_owned())
    }

    // ---- message handling -------------------------------------------------

    /// `mnget`: stream our future votes to a bootstrapping peer.
    pub fn handle_payment_sync(&self, peer: &PeerInfo, _votes_needed: i32) {
        if !self.sync.is_list_synced() {
            return;
        }
        // Heavy; ignore it until we finished our own sync.
        let tip = self.chain.tip_height().unwrap_or_default();
        if !self.sync.is_synced(tip) {
            return;
        }
        let now = self.clock.now();
        if self.fulfilled.has(&peer.addr, opcode::MNGET, now) {
            // Asking for the list twice in a short period is no good.
            debug!("{} already asked for the payment list", peer.addr);
            self.net.misbehaving(peer.id, 20);
            return;
        }
        self.fulfilled.add(peer.addr, opcode::MNGET, now);
        self.sync_to_peer(peer);
    }

    /// Send only votes for future blocks; peers request every other missing
    /// height individually.
    fn sync_to_peer(&self, peer: &PeerInfo) {
        let inner = self.inner.read();
        let Some(tip) = inner.tip_height else {
            return;
        };
        let mut sent = 0;
        for height in tip..tip + FUTURE_VOTE_BLOCKS {
            if let Some(block) = inner.blocks.get(&height) {
                for payee in &block.payees {
                    for hash in payee.vote_hashes() {
                        let Some(vote) = inner.votes.get(hash) else {
                            continue;
                        };
                        if !vote.is_verified() {
                            continue;
                        }
                        self.net.send_to(peer.id, opcode::MNWINNER, vote);
                        sent += 1;
                    }
                }
            }
        }
        info!("sent {sent} payment votes to {}", peer.addr);
        self.net
            .send_to(peer.id, opcode::SYNCSTATUSCOUNT, &(SYNC_ITEM_MNW, sent));
    }

    /// `mnw`: a payment vote from the network.
    pub fn handle_vote(&self, from: Option<&PeerInfo>, vote: PaymentVote) {
        if !self.sync.is_list_synced() {
            return;
        }
        if let Some(peer) = from {
            if peer.protocol_version < self.min_payments_proto() {
                return;
            }
        }
        let Some(tip) = self.inner.read().tip_height else {
            return;
        };
        let hash = vote.hash();

        {
            let mut inner = self.inner.write();
            if inner.votes.contains_key(&hash) {
                debug!("payment vote at height {} seen", vote.block_height);
                return;
            }
            // Remember it right away to avoid processing it twice, but as
            // unverified until all checks pass.
            let mut placeholder = vote.clone();
            placeholder.mark_not_verified();
            inner.votes.insert(hash, placeholder);
        }

        let first_block = tip - self.storage_limit();
        if vote.block_height < first_block || vote.block_height > tip + FUTURE_VOTE_BLOCKS {
            debug!(
                "payment vote out of range: first block {first_block}, vote height {}, tip {tip}",
                vote.block_height
            );
            return;
        }

        if let Err(rejected) = self.vote_is_valid(from, &vote, tip) {
            debug!("invalid payment vote: {rejected}");
            if let Some(peer) = from {
                self.net.misbehaving(peer.id, rejected.dos);
            }
            return;
        }

        if !self.can_vote(&vote.voter, vote.block_height) {
            debug!(
                "subinode {} already voted for height {}",
                vote.voter.short(),
                vote.block_height
            );
            return;
        }

        let Some(voter) = self.manager.info(&vote.voter) else {
            // Unknown voter; some info is probably missing, ask the sender.
            debug!("subinode {} is missing", vote.voter.short());
            if let Some(peer) = from {
                self.manager.ask_for_node(peer, &vote.voter);
            }
            return;
        };

        let list_synced = self.sync.is_list_synced();
        if let Err(rejected) = vote.check_signature(&voter.service_pubkey, tip, list_synced) {
            if rejected.dos > 0 {
                if let Some(peer) = from {
                    self.net.misbehaving(peer.id, rejected.dos);
                }
            }
            // Our record of the voter may be outdated; ask for a refresh.
            // Nothing to be done when the vote itself was signed with a
            // rotated key.
            if let Some(peer) = from {
                self.manager.ask_for_node(peer, &vote.voter);
            }
            return;
        }

        if self.add_vote(&vote) {
            self.relay_vote(&vote);
            self.events.emit(TierEvent::PaymentVoteAdded);
        }
    }

    /// Rank-based vote admission: only the top voters for the target height
    /// are heard; deep outliers on fresh heights are penalized.
    fn vote_is_valid(
        &self,
        from: Option<&PeerInfo>,
        vote: &PaymentVote,
        validation_height: BlockHeight,
    ) -> Result<(), Rejected> {
        let Some(voter) = self.manager.info(&vote.voter) else {
            // Only ask when we are synced and still have no idea.
            if self.sync.is_list_synced() {
                if let Some(peer) = from {
                    self.manager.ask_for_node(peer, &vote.voter);
                }
            }
            return Err(Rejected::soft(format!(
                "unknown subinode, prevout={}",
                vote.voter.short()
            )));
        };

        let min_required_proto = if vote.block_height >= validation_height {
            self.min_payments_proto()
        } else {
            // Allow non-updated subinodes for old blocks.
            MIN_PAYMENT_PROTO_VERSION_1
        };
        if voter.protocol_version < min_required_proto {
            return Err(Rejected::soft(format!(
                "subinode protocol is too old: {} < {min_required_proto}",
                voter.protocol_version
            )));
        }

        // Non-subinodes only care about rank for future block votes.
        if !self.identity.is_service_node() && vote.block_height < validation_height {
            return Ok(());
        }

        let rank = self
            .manager
            .rank(&vote.voter, vote.block_height - 100, min_required_proto, false);
        if rank == -1 {
            return Err(Rejected::soft(format!(
                "can't calculate rank for subinode {}",
                vote.voter.short()
            )));
        }
        if rank > MNPAYMENTS_SIGNATURES_TOTAL {
            // It's common for nodes to mistakenly think they just made the
            // top ten; only deep outliers voting on fresh heights get
            // penalized.
            let dos = if rank > MNPAYMENTS_SIGNATURES_TOTAL * 2
                && vote.block_height > validation_height
            {
                20
            } else {
                0
            };
            return Err(Rejected::new(
                dos,
                format!(
                    "subinode is not in the top {MNPAYMENTS_SIGNATURES_TOTAL} ({rank})"
                ),
            ));
        }
        Ok(())
    }

    fn relay_vote(&self, vote: &PaymentVote) {
        // Do not relay until the winners list is in; we would only spread
        // stale elections.
        if !self.sync.is_winners_synced() {
            return;
        }
        self.net.broadcast(opcode::MNWINNER, vote);
    }

    /// Vote for the winner at `height` with our own service key.
    pub fn process_block(&self, height: BlockHeight) -> bool {
        if !self.identity.is_service_node() {
            return false;
        }
        // Little chance to pick the right winner while the list is out of
        // sync, and no way at all without enough node data.
        if !self.sync.is_list_synced() {
            return false;
        }

        let our_outpoint = self.identity.outpoint();
        let rank = self.manager.rank(
            &our_outpoint,
            height - 100,
            self.min_payments_proto(),
            false,
        );
        if rank == -1 {
            debug!("process block: unknown subinode");
            return false;
        }
        if rank > MNPAYMENTS_SIGNATURES_TOTAL {
            debug!("process block: not in the top {MNPAYMENTS_SIGNATURES_TOTAL} ({rank})");
            return false;
        }

        // Pay the oldest node with an input old enough, active long enough.
        let (winner, _) = self.manager.next_in_queue_for_payment(height, true, self);
        let Some(winner) = winner else {
            warn!("failed to find a subinode to pay at height {height}");
            return false;
        };

        let mut vote = PaymentVote::new(our_outpoint, height, winner.payee());
        let Some(key) = self.identity.service_key() else {
            return false;
        };
        if !vote.sign(&key, &self.identity.service_pubkey()) {
            warn!("failed to sign payment vote");
            return false;
        }
        if self.add_vote(&vote) {
            self.relay_vote(&vote);
            return true;
        }
        false
    }

    /// Fetch election data for heights we know nothing (or too little)
    /// about, in inventory-sized batches.
    pub fn request_low_data_blocks(&self, peer: &PeerInfo) {
        let limit = self.storage_limit();
        let inner = self.inner.read();
        let Some(tip) = inner.tip_height else {
            return;
        };

        let mut to_fetch: Vec<Inv> = Vec::new();
        let mut height = tip;
        while tip - height < limit && height >= 0 {
            if !inner.blocks.contains_key(&height) {
                // No idea about this height at all, let's ask.
                if let Some(hash) = self.chain.block_hash(height) {
                    to_fetch.push(Inv::new(InvKind::PaymentBlock, hash));
                }
                if to_fetch.len() == MAX_INV_SIZE {
                    self.net.fetch_inventory(peer.id, std::mem::take(&mut to_fetch));
                }
            }
            height -= 1;
        }

        let average_votes =
            (MNPAYMENTS_SIGNATURES_TOTAL as usize + MNPAYMENTS_SIGNATURES_REQUIRED) / 2;
        for (height, block) in &inner.blocks {
            let mut total_votes = 0;
            let mut decided = false;
            for payee in &block.payees {
                if payee.vote_count() >= MNPAYMENTS_SIGNATURES_REQUIRED {
                    decided = true;
                    break;
                }
                total_votes += payee.vote_count();
            }
            // A clear winner, or at least an average number of votes: fine.
            if decided || total_votes >= average_votes {
                continue;
            }
            // Low data block, try to sync it.
            if let Some(hash) = self.chain.block_hash(*height) {
                to_fetch.push(Inv::new(InvKind::PaymentBlock, hash));
            }
            if to_fetch.len() == MAX_INV_SIZE {
                self.net.fetch_inventory(peer.id, std::mem::take(&mut to_fetch));
            }
        }
        if !to_fetch.is_empty() {
            debug!("asking {} for {} payment blocks", peer.addr, to_fetch.len());
            self.net.fetch_inventory(peer.id, to_fetch);
        }
    }

    /// Evict votes and buckets that fell out of the storage window.
    pub fn check_and_remove(&self) {
        let limit = self.storage_limit();
        let mut inner = self.inner.write();
        let Some(tip) = inner.tip_height else {
            return;
        };
        let PaymentsInner { votes, blocks, .. } = &mut *inner;
        votes.retain(|_, vote| {
            if tip - vote.block_height > limit {
                blocks.remove(&vote.block_height);
                false
            } else {
                true
            }
        });
        debug!(
            "payment store after cleanup: Votes: {}, Blocks: {}",
            votes.len(),
            blocks.len()
        );
    }

    /// Enough blocks and votes banked to stop bulk-syncing.
    pub fn is_enough_data(&self) -> bool {
        let average_votes =
            (MNPAYMENTS_SIGNATURES_TOTAL as usize + MNPAYMENTS_SIGNATURES_REQUIRED) / 2;
        let limit = self.storage_limit();
        let inner = self.inner.read();
        inner.blocks.len() as i64 > limit
            && inner.votes.len() as i64 > limit * average_votes as i64
    }

    pub fn updated_block_tip(&self, height: BlockHeight) {
        self.inner.write().tip_height = Some(height);
        debug!("payment voter sees new tip {height}");
        // TODO: revisit the five-block vote lead; one block plus relay
        // latency may be sufficient.
        self.process_block(height + 5);
    }

    // ---- persistence ------------------------------------------------------

    pub fn dump(&self, path: &Path) -> std::io::Result<()> {
        let inner = self.inner.read();
        let dump = PaymentsDump {
            votes: inner.votes.clone(),
            blocks: inner.blocks.clone(),
        };
        drop(inner);
        store::save_dump(path, SERIALIZATION_VERSION, &dump)
    }

    pub fn load(&self, path: &Path) -> bool {
        match store::load_dump::<PaymentsDump>(path, SERIALIZATION_VERSION) {
            Some(dump) => {
                let mut inner = self.inner.write();
                inner.votes = dump.votes;
                inner.blocks = dump.blocks;
                true
            }
            None => {
                self.clear();
                false
            }
        }
    }
}

impl PaymentsView for SubinodePayments {
    /// Minimum protocol eligible for payment. Above the fee-distribution
    /// start height the newer floor applies unconditionally; below it the
    /// pay-updated-nodes spork decides.
    fn min_payments_proto(&self) -> i32 {
        let tip = self.chain.tip_height().unwrap_or_default();
        if tip > self.params.fee_distribution_start_block {
            return MIN_PAYMENT_PROTO_VERSION_2;
        }
        if self.sporks.is_active(Spork::PayUpdatedNodes) {
            MIN_PAYMENT_PROTO_VERSION_2
        } else {
            MIN_PAYMENT_PROTO_VERSION_1
        }
    }

    fn is_scheduled(&self, payee: &Script, skip_height: BlockHeight) -> bool {
        self.is_scheduled_payee(payee, skip_height)
    }

    fn has_payee_with_votes(
        &self,
        height: BlockHeight,
        payee: &Script,
        min_votes: usize,
    ) -> bool {
        self.inner
            .read()
            .blocks
            .get(&height)
            .map(|block| block.has_payee_with_votes(payee, min_votes))
            .unwrap_or(false)
    }

    /// Node count times the storage coefficient, floored at the minimum.
    fn storage_limit(&self) -> i64 {
        ((self.manager.size() as i64) * 5 / 4).max(MIN_BLOCKS_TO_STORE)
    }
}

impl fmt::Display for SubinodePayments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        write!(
            f,
            "Votes: {}, Blocks: {}",
            inner.votes.len(),
            inner.blocks.len()
        )
    }
}

/// Serializable snapshot of the payment store, written to `payments.dat`.
#[derive(Serialize, Deserialize)]
pub struct PaymentsDump {
    pub votes: HashMap<Hash256, PaymentVote>,
    pub blocks: BTreeMap<BlockHeight, BlockPayees>,
}
