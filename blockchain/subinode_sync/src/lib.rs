// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Staged bootstrap of the tier state: sporks first, then the subinode
//! directory, then the payment vote history. A monotone state machine
//! driven by a six second tick, failing over to a cooldown on starvation.

#[cfg(test)]
mod sync_test;

use log::{debug, error, info};
use parking_lot::RwLock;
use std::sync::Arc;
use subi_chain::{ChainView, Clock, SyncStage, SyncStatus};
use subi_net::{opcode, NetFulfilledRegistry, NetService, PeerView};
use subi_networks::ChainParams;
use subi_payments::SubinodePayments;
use subi_subinode::{LocalIdentity, PaymentsView, SubinodeManager};

/// Seconds between driver passes.
pub const SYNC_TICK_SECONDS: i64 = 6;
/// A stage with no progress for this long times out.
pub const SYNC_TIMEOUT_SECONDS: i64 = 30;
/// Cooldown before a failed sync may restart.
pub const SYNC_FAILURE_COOLDOWN_SECONDS: i64 = 60;
/// Peers that must sit at our height before the tier trusts the chain.
pub const SYNC_ENOUGH_PEERS: usize = 1;

/// A wall-clock gap this long between driver passes means the process was
/// suspended; start over.
const SLEEP_GAP_SECONDS: i64 = 60 * 60;

struct SyncInner {
    attempt: i32,
    asset_started_at: i64,
    time_last_list: i64,
    time_last_vote: i64,
    time_last_failure: i64,
    time_last_process: i64,
    first_block_accepted: bool,
    tick: u64,
}

/// Drives the multi-stage tier download against connected peers.
pub struct SubinodeSync {
    inner: RwLock<SyncInner>,
    status: Arc<SyncStatus>,
    manager: Arc<SubinodeManager>,
    payments: Arc<SubinodePayments>,
    chain: Arc<dyn ChainView>,
    clock: Arc<dyn Clock>,
    params: &'static ChainParams,
    net: NetService,
    fulfilled: Arc<NetFulfilledRegistry>,
    peers: Arc<dyn PeerView>,
    identity: Arc<LocalIdentity>,
}

impl SubinodeSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        status: Arc<SyncStatus>,
        manager: Arc<SubinodeManager>,
        payments: Arc<SubinodePayments>,
        chain: Arc<dyn ChainView>,
        clock: Arc<dyn Clock>,
        params: &'static ChainParams,
        net: NetService,
        fulfilled: Arc<NetFulfilledRegistry>,
        peers: Arc<dyn PeerView>,
        identity: Arc<LocalIdentity>,
    ) -> Self {
        let now = clock.now();
        SubinodeSync {
            inner: RwLock::new(SyncInner {
                attempt: 0,
                asset_started_at: now,
                time_last_list: now,
                time_last_vote: now,
                time_last_failure: 0,
                time_last_process: now,
                first_block_accepted: false,
                tick: 0,
            }),
            status,
            manager,
            payments,
            chain,
            clock,
            params,
            net,
            fulfilled,
            peers,
            identity,
        }
    }

    pub fn stage(&self) -> SyncStage {
        self.status.stage()
    }

    pub fn attempt(&self) -> i32 {
        self.inner.read().attempt
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    pub fn is_synced(&self, height: subi_types::BlockHeight) -> bool {
        self.status.is_synced(height)
    }

    /// Human-readable status for the UI and RPC.
    pub fn status_text(&self) -> &'static str {
        match self.status.stage() {
            SyncStage::Initial => "Synchronization pending...",
            SyncStage::Sporks => "Synchronizing sporks...",
            SyncStage::List => "Synchronizing subinodes...",
            SyncStage::Winners => "Synchronizing subinode payments...",
            SyncStage::Failed => "Synchronization failed",
            SyncStage::Finished => "Synchronization finished",
        }
    }

    /// Coarse progress for the UI: eight probes per stage, four stages.
    pub fn progress(&self) -> f64 {
        let stage_index = match self.status.stage() {
            SyncStage::Failed => return 0.0,
            SyncStage::Initial => 0,
            SyncStage::Sporks => 1,
            SyncStage::List => 2,
            SyncStage::Winners => 3,
            SyncStage::Finished => return 1.0,
        };
        let attempt = self.inner.read().attempt;
        ((f64::from(attempt) + (stage_index as f64 - 1.0) * 8.0) / (8.0 * 4.0)).max(0.0)
    }

    /// Directory progress signal, fed from the manager's events.
    pub fn note_list_progress(&self) {
        self.inner.write().time_last_list = self.clock.now();
    }

    /// Vote progress signal, fed from the payment voter's events.
    pub fn note_vote_progress(&self) {
        self.inner.write().time_last_vote = self.clock.now();
    }

    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        inner.attempt = 0;
        inner.asset_started_at = now;
        inner.time_last_list = now;
        inner.time_last_vote = now;
        inner.time_last_failure = 0;
        self.status.set_stage(SyncStage::Initial);
    }

    fn fail(&self) {
        let mut inner = self.inner.write();
        inner.time_last_failure = self.clock.now();
        self.status.set_stage(SyncStage::Failed);
    }

    fn switch_to_next_asset(&self) {
        let now = self.clock.now();
        let next = match self.status.stage() {
            SyncStage::Failed => {
                error!("can't switch to the next asset from failed, reset first");
                return;
            }
            SyncStage::Initial => {
                self.clear_fulfilled_requests();
                SyncStage::Sporks
            }
            SyncStage::Sporks => {
                self.inner.write().time_last_list = now;
                SyncStage::List
            }
            SyncStage::List => {
                self.inner.write().time_last_vote = now;
                SyncStage::Winners
            }
            SyncStage::Winners | SyncStage::Finished => {
                info!("tier sync has finished");
                SyncStage::Finished
            }
        };
        self.status.set_stage(next);
        info!("starting {next}");
        let mut inner = self.inner.write();
        inner.attempt = 0;
        inner.asset_started_at = now;
    }

    fn clear_fulfilled_requests(&self) {
        for peer in self.peers.peers() {
            self.fulfilled.remove(&peer.addr, "spork-sync");
            self.fulfilled.remove(&peer.addr, "subinode-list-sync");
            self.fulfilled.remove(&peer.addr, "subinode-payment-sync");
            self.fulfilled.remove(&peer.addr, "full-sync");
        }
    }

    /// Whether the block chain itself looks caught up: enough peers within
    /// one block of our tip and a tip younger than the staleness horizon.
    /// Resets the whole pipeline after a long process suspension.
    pub fn is_blockchain_synced(&self, block_accepted: bool) -> bool {
        let now = self.clock.now();
        let tip = self.chain.tip_height();

        if tip.unwrap_or_default() <= self.params.tier_initialize_height {
            self.status.set_blockchain_synced(true);
            return true;
        }

        {
            let last_process = self.inner.read().time_last_process;
            if now - last_process > SLEEP_GAP_SECONDS {
                debug!("long gap between sync checks, resetting");
                self.reset();
                self.status.set_blockchain_synced(false);
            }
        }

        let Some(tip) = tip else {
            return false;
        };

        if block_accepted {
            // Only meaningful while we are still downloading.
            if !self.status.is_synced(tip) {
                let mut inner = self.inner.write();
                inner.first_block_accepted = true;
                inner.time_last_process = now;
                self.status.set_blockchain_synced(false);
                return false;
            }
        } else {
            // Skip if checked less than a tick ago.
            let inner = self.inner.read();
            if now - inner.time_last_process < SYNC_TICK_SECONDS {
                return self.status.is_blockchain_synced();
            }
        }
        self.inner.write().time_last_process = now;

        if self.status.is_blockchain_synced() {
            return true;
        }

        let peers = self.peers.peers();
        if peers.len() >= self.params.sync_enough_peers {
            let mut at_same_height = 0;
            for peer in &peers {
                if peer.common_height == -1 || peer.sync_height == -1 {
                    continue; // not enough info about this peer
                }
                if tip - 1 > peer.common_height {
                    continue; // peer is probably stuck
                }
                if tip < peer.sync_height - 1 {
                    continue; // peer announced more headers than we have
                }
                at_same_height += 1;
                if at_same_height >= self.params.sync_enough_peers {
                    debug!("found enough peers at our height, chain is synced");
                    self.status.set_blockchain_synced(true);
                    return true;
                }
            }
        }

        if !self.inner.read().first_block_accepted {
            return false;
        }

        let tip_fresh = self
            .chain
            .block_time(tip)
            .map(|time| now - time < self.params.max_tip_age)
            .unwrap_or(false);
        self.status.set_blockchain_synced(tip_fresh);
        tip_fresh
    }

    /// `ssc` from a peer: progress accounting only, never authoritative.
    pub fn handle_sync_status_count(&self, item_id: i32, count: i32) {
        let tip = self.chain.tip_height().unwrap_or_default();
        if self.status.is_synced(tip) || self.status.is_failed() {
            return;
        }
        debug!("got sync inventory count: item {item_id}, count {count}");
    }

    /// One driver pass; invoked every second, active every sixth.
    pub fn process_tick(&self) {
        {
            let mut inner = self.inner.write();
            inner.tick += 1;
            if inner.tick % SYNC_TICK_SECONDS as u64 != 0 {
                return;
            }
        }
        let Some(tip) = self.chain.tip_height() else {
            return;
        };
        let now = self.clock.now();

        debug!(
            "sync tick: stage {}, attempt {}, progress {:.2}",
            self.status.stage(),
            self.attempt(),
            self.progress()
        );

        if self.status.is_synced(tip) {
            return;
        }

        // Try again after a failure, once the cooldown passed.
        if self.status.is_failed() {
            if self.inner.read().time_last_failure + SYNC_FAILURE_COOLDOWN_SECONDS < now {
                self.reset();
            }
            return;
        }

        let stage = self.status.stage();
        if !self.params.network.is_regtest()
            && !self.is_blockchain_synced(false)
            && stage.as_i32() > SyncStage::Sporks.as_i32()
        {
            // The chain fell behind; keep the stage timers alive so the
            // tier stages don't time out through no fault of the peers.
            let mut inner = self.inner.write();
            inner.time_last_list = now;
            inner.time_last_vote = now;
            return;
        }
        if stage == SyncStage::Initial
            || (stage == SyncStage::Sporks && self.is_blockchain_synced(false))
        {
            self.switch_to_next_asset();
        }

        let min_proto = self.payments.min_payments_proto();
        let we_are_subinode = self.identity.is_service_node();

        for peer in self.peers.peers() {
            // Outbound subinode links are temporary and unreliable for
            // sync; an inbound connection this early is most likely one.
            if peer.subinode_link || (we_are_subinode && peer.inbound) {
                continue;
            }

            // Quick mode, regtest only.
            if self.params.network.is_regtest() {
                let attempt = self.inner.read().attempt;
                if attempt <= 2 {
                    self.net.send_to(peer.id, opcode::GETSPORKS, &());
                } else if attempt < 4 {
                    self.manager.dseg_update(&peer);
                } else if attempt < 6 {
                    let count = self.manager.count(min_proto) as i32;
                    self.net.send_to(peer.id, opcode::MNGET, &count);
                } else {
                    self.status.set_stage(SyncStage::Finished);
                }
                self.inner.write().attempt += 1;
                return;
            }

            if self.fulfilled.has(&peer.addr, "full-sync", now) {
                // We already synced everything from this peer recently;
                // free the slot for someone else.
                self.net.disconnect(peer.id);
                debug!("disconnecting from recently synced peer {}", peer.addr);
                continue;
            }

            // Sporks are requested from every peer, before anything else.
            if !self.fulfilled.has(&peer.addr, "spork-sync", now) {
                self.fulfilled.add(peer.addr, "spork-sync", now);
                self.net.send_to(peer.id, opcode::GETSPORKS, &());
                continue; // move on without waiting for the next tick
            }

            match self.status.stage() {
                SyncStage::List => {
                    if self.inner.read().time_last_list < now - SYNC_TIMEOUT_SECONDS {
                        // No progress within the window.
                        if self.inner.read().attempt == 0 {
                            // No way to continue without the node list.
                            error!("failed to sync the subinode list");
                            self.fail();
                            return;
                        }
                        self.switch_to_next_asset();
                        return;
                    }
                    if self.fulfilled.has(&peer.addr, "subinode-list-sync", now) {
                        continue;
                    }
                    self.fulfilled.add(peer.addr, "subinode-list-sync", now);
                    if peer.protocol_version < min_proto {
                        continue;
                    }
                    self.inner.write().attempt += 1;
                    self.manager.dseg_update(&peer);
                    // One request per peer per tick across the assets.
                    return;
                }
                SyncStage::Winners => {
                    // This can take longer than the timeout due to new
                    // blocks, but it does time out eventually.
                    if self.inner.read().time_last_vote < now - SYNC_TIMEOUT_SECONDS {
                        if self.inner.read().attempt == 0 {
                            error!("failed to sync the payment votes");
                            self.fail();
                            return;
                        }
                        self.switch_to_next_asset();
                        return;
                    }
                    // Enough banked data is also enough, after probing at
                    // least two peers.
                    if self.inner.read().attempt > 1 && self.payments.is_enough_data() {
                        self.switch_to_next_asset();
                        return;
                    }
                    if self.fulfilled.has(&peer.addr, "subinode-payment-sync", now) {
                        continue;
                    }
                    self.fulfilled.add(peer.addr, "subinode-payment-sync", now);
                    if peer.protocol_version < min_proto {
                        continue;
                    }
                    self.inner.write().attempt += 1;
                    // Ask for all the votes it has (new nodes will only
                    // return votes for future payments) ...
                    let limit = self.payments.storage_limit() as i32;
                    self.net.send_to(peer.id, opcode::MNGET, &limit);
                    // ... and for the missing pieces individually.
                    self.payments.request_low_data_blocks(&peer);
                    return;
                }
                _ => {}
            }
        }
    }

    pub fn updated_block_tip(&self) {
        self.is_blockchain_synced(true);
    }
}
