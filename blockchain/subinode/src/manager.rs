// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{
    store, Announce, CheckContext, LocalIdentity, OutpointCheck, PaymentsView, Ping, Rejected,
    Subinode, SubinodeIndex, SubinodeInfo, SubinodeState, Verify, DSEG_UPDATE_SECONDS,
    LAST_PAID_SCAN_BLOCKS, MAX_EXPECTED_INDEX_SIZE, MAX_POSE_BLOCKS, MAX_POSE_CONNECTIONS,
    MAX_POSE_RANK, MIN_ANNOUNCE_SECONDS, MIN_INDEX_REBUILD_TIME, MIN_PING_SECONDS,
    MNB_RECOVERY_MAX_ASK_ENTRIES, MNB_RECOVERY_QUORUM_REQUIRED, MNB_RECOVERY_QUORUM_TOTAL,
    MNB_RECOVERY_RETRY_SECONDS, MNB_RECOVERY_WAIT_SECONDS, NEW_START_REQUIRED_SECONDS,
    POSE_BAN_MAX_SCORE, WATCHDOG_MAX_SECONDS,
};
use ethereum_types::U256;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use subi_chain::{ChainView, Clock, EventBus, PaymentSchedule, SyncStatus, TierEvent};
use subi_net::{opcode, NetFulfilledRegistry, NetService, PeerInfo, WirePayload, SYNC_ITEM_LIST};
use subi_networks::{ChainParams, PROTOCOL_VERSION, SUBINODE_COLLATERAL};
use subi_types::{BlockHeight, Hash256, NetAddress, OutPoint, PubKey, Script};

const SERIALIZATION_VERSION: &str = "SubinodeManager-v4";

/// Everything behind the manager lock.
#[derive(Default)]
struct ManagerInner {
    nodes: Vec<Subinode>,
    asked_us_for_list: HashMap<NetAddress, i64>,
    we_asked_for_list: HashMap<NetAddress, i64>,
    we_asked_for_entry: HashMap<OutPoint, HashMap<NetAddress, i64>>,
    we_asked_for_verification: HashMap<NetAddress, Verify>,
    recovery_requests: HashMap<Hash256, (i64, HashSet<NetAddress>)>,
    recovery_good_replies: HashMap<Hash256, Vec<Announce>>,
    scheduled_recovery_connections: Vec<(NetAddress, OutPoint)>,
    seen_announces: HashMap<Hash256, (i64, Announce)>,
    seen_pings: HashMap<Hash256, Ping>,
    seen_verifications: HashMap<Hash256, Verify>,
    index: SubinodeIndex,
    old_index: SubinodeIndex,
    index_rebuilt: bool,
    last_index_rebuild_time: i64,
    last_watchdog_vote_time: i64,
    dsq_count: i64,
    tip_height: Option<BlockHeight>,
    first_paid_scan: bool,
}

/// The authoritative set of known subinodes.
pub struct SubinodeManager {
    inner: RwLock<ManagerInner>,
    chain: Arc<dyn ChainView>,
    clock: Arc<dyn Clock>,
    params: &'static ChainParams,
    net: NetService,
    events: EventBus,
    fulfilled: Arc<NetFulfilledRegistry>,
    identity: Arc<LocalIdentity>,
    sync: Arc<SyncStatus>,
}

impl SubinodeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainView>,
        clock: Arc<dyn Clock>,
        params: &'static ChainParams,
        net: NetService,
        events: EventBus,
        fulfilled: Arc<NetFulfilledRegistry>,
        identity: Arc<LocalIdentity>,
        sync: Arc<SyncStatus>,
    ) -> Self {
        let mut inner = ManagerInner::default();
        inner.first_paid_scan = true;
        SubinodeManager {
            inner: RwLock::new(inner),
            chain,
            clock,
            params,
            net,
            events,
            fulfilled,
            identity,
            sync,
        }
    }

    fn our_service_key(&self) -> Option<PubKey> {
        if self.identity.is_service_node() {
            Some(self.identity.service_pubkey())
        } else {
            None
        }
    }

    fn check_context<'a>(
        &'a self,
        our_key: &'a Option<PubKey>,
        min_proto: i32,
        node_count: usize,
        watchdog_active: bool,
    ) -> CheckContext<'a> {
        CheckContext {
            now: self.clock.now(),
            tip_height: self.chain.tip_height(),
            chain: &*self.chain,
            min_payments_proto: min_proto,
            protocol_version: PROTOCOL_VERSION,
            list_synced: self.sync.is_list_synced(),
            watchdog_active,
            our_service_pubkey: our_key.as_ref(),
            node_count,
        }
    }

    fn watchdog_active_inner(&self, inner: &ManagerInner, now: i64) -> bool {
        let tip = self.chain.tip_height().unwrap_or_default();
        self.sync.is_synced(tip) && now - inner.last_watchdog_vote_time <= WATCHDOG_MAX_SECONDS
    }

    // ---- plain lookups -------------------------------------------------

    pub fn size(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn count(&self, min_proto: i32) -> usize {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|node| node.protocol_version >= min_proto)
            .count()
    }

    pub fn count_enabled(&self, min_proto: i32) -> usize {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .count()
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.inner
            .read()
            .nodes
            .iter()
            .any(|node| node.outpoint == *outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<Subinode> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|node| node.outpoint == *outpoint)
            .cloned()
    }

    pub fn info(&self, outpoint: &OutPoint) -> Option<SubinodeInfo> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|node| node.outpoint == *outpoint)
            .map(Subinode::info)
    }

    pub fn info_by_service_key(&self, key: &PubKey) -> Option<SubinodeInfo> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|node| node.service_pubkey == *key)
            .map(Subinode::info)
    }

    pub fn info_by_payee(&self, payee: &Script) -> Option<SubinodeInfo> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|node| node.payee() == *payee)
            .map(Subinode::info)
    }

    /// State of a record, `NewStartRequired` for unknown outpoints.
    pub fn state_of(&self, outpoint: &OutPoint) -> SubinodeState {
        self.info(outpoint)
            .map(|info| info.state)
            .unwrap_or(SubinodeState::NewStartRequired)
    }

    pub fn is_pinged_within(&self, outpoint: &OutPoint, seconds: i64, at: i64) -> bool {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|node| node.outpoint == *outpoint)
            .map(|node| node.is_pinged_within(seconds, at))
            .unwrap_or(false)
    }

    /// Install a self-signed ping on our own record and remember it.
    pub fn set_last_ping(&self, outpoint: &OutPoint, ping: Ping) {
        let mut inner = self.inner.write();
        inner.seen_pings.insert(ping.hash(), ping.clone());
        let Some(node) = inner
            .nodes
            .iter_mut()
            .find(|node| node.outpoint == *outpoint)
        else {
            return;
        };
        node.last_ping = ping.clone();
        let announce_hash = Announce::from_node(node).hash();
        if let Some(entry) = inner.seen_announces.get_mut(&announce_hash) {
            entry.1.last_ping = ping;
        }
    }

    /// Compact index queries.
    pub fn index_of(&self, outpoint: &OutPoint) -> i32 {
        self.inner.read().index.index_of(outpoint)
    }

    pub fn outpoint_at_index(&self, index: i32) -> Option<OutPoint> {
        self.inner.read().index.get(index)
    }

    pub fn update_watchdog_vote_time(&self, outpoint: &OutPoint) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        if let Some(node) = inner
            .nodes
            .iter_mut()
            .find(|node| node.outpoint == *outpoint)
        {
            node.update_watchdog_vote_time(now);
            inner.last_watchdog_vote_time = now;
        }
    }

    pub fn is_watchdog_active(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.read();
        now - inner.last_watchdog_vote_time <= WATCHDOG_MAX_SECONDS
    }

    // ---- mutation ------------------------------------------------------

    /// Add a record; true iff no record exists for its collateral.
    pub fn add(&self, node: Subinode) -> bool {
        let mut inner = self.inner.write();
        self.add_inner(&mut inner, node)
    }

    fn add_inner(&self, inner: &mut ManagerInner, node: Subinode) -> bool {
        if inner.nodes.iter().any(|n| n.outpoint == node.outpoint) {
            return false;
        }
        debug!("adding new subinode: addr={}, {} now", node.addr, inner.nodes.len() + 1);
        inner.index.insert(node.outpoint);
        inner.nodes.push(node);
        self.events.emit(TierEvent::SubinodeListUpdated);
        true
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = ManagerInner {
            first_paid_scan: true,
            ..ManagerInner::default()
        };
    }

    /// Run the state machine over one record.
    pub fn check_subinode(&self, outpoint: &OutPoint, force: bool, payments: &dyn PaymentsView) {
        let our_key = self.our_service_key();
        let min_proto = payments.min_payments_proto();
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let watchdog = self.watchdog_active_inner(&inner, now);
        let count = inner.nodes.len();
        let ctx = self.check_context(&our_key, min_proto, count, watchdog);
        if let Some(node) = inner
            .nodes
            .iter_mut()
            .find(|node| node.outpoint == *outpoint)
        {
            node.check(force, &ctx);
        }
    }

    pub fn check_subinode_by_key(&self, key: &PubKey, force: bool, payments: &dyn PaymentsView) {
        let outpoint = match self.info_by_service_key(key) {
            Some(info) => info.outpoint,
            None => return,
        };
        self.check_subinode(&outpoint, force, payments);
    }

    /// Run the state machine over every record.
    pub fn check_all(&self, payments: &dyn PaymentsView) {
        let our_key = self.our_service_key();
        let min_proto = payments.min_payments_proto();
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let watchdog = self.watchdog_active_inner(&inner, now);
        let count = inner.nodes.len();
        let ctx = self.check_context(&our_key, min_proto, count, watchdog);
        for node in inner.nodes.iter_mut() {
            node.check(false, &ctx);
        }
    }

    /// Check every record, erase the spent ones, schedule recovery for the
    /// restart-required ones and expire the bookkeeping maps.
    pub fn check_and_remove(&self, payments: &dyn PaymentsView) {
        if !self.sync.is_list_synced() {
            return;
        }

        let our_key = self.our_service_key();
        let min_proto = payments.min_payments_proto();
        let now = self.clock.now();
        let tip = self.chain.tip_height();
        let mut recovery_replays: Vec<Announce> = Vec::new();
        let mut removed = false;

        {
            let mut inner = self.inner.write();
            let watchdog = self.watchdog_active_inner(&inner, now);
            let count = inner.nodes.len();
            let ctx = self.check_context(&our_key, min_proto, count, watchdog);

            // Remove spent nodes, schedule recovery probes for the rest.
            let mut ask_budget = MNB_RECOVERY_MAX_ASK_ENTRIES;
            let mut rank_list: Option<Vec<(i64, SubinodeInfo)>> = None;
            let mut i = 0;
            while i < inner.nodes.len() {
                inner.nodes[i].check(false, &ctx);
                let node = &inner.nodes[i];
                let hash = Announce::from_node(node).hash();

                if node.is_outpoint_spent() {
                    debug!(
                        "removing subinode: {} addr={} {} now",
                        node.state,
                        node.addr,
                        inner.nodes.len() - 1
                    );
                    let outpoint = node.outpoint;
                    inner.seen_announces.remove(&hash);
                    inner.we_asked_for_entry.remove(&outpoint);
                    inner.nodes.remove(i);
                    removed = true;
                    continue;
                }

                let ask = tip.is_some()
                    && ask_budget > 0
                    && self.sync.is_synced(tip.unwrap_or_default())
                    && node.is_new_start_required()
                    && !inner.recovery_requests.contains_key(&hash);
                if ask {
                    let outpoint = node.outpoint;
                    if rank_list.is_none() {
                        let random_height =
                            rand::thread_rng().gen_range(0..=tip.unwrap_or_default().max(0));
                        rank_list = Some(self.ranks_inner(&inner, random_height, 0));
                    }
                    let mut requested: HashSet<NetAddress> = HashSet::new();
                    let asked_entry = inner.we_asked_for_entry.get(&outpoint);
                    let mut scheduled = Vec::new();
                    for (_, info) in rank_list.as_ref().unwrap() {
                        if requested.len() >= MNB_RECOVERY_QUORUM_TOTAL {
                            break;
                        }
                        // Avoid peers we asked for this entry recently.
                        if asked_entry
                            .map(|m| m.contains_key(&info.addr))
                            .unwrap_or(false)
                        {
                            continue;
                        }
                        requested.insert(info.addr);
                        scheduled.push((info.addr, outpoint));
                    }
                    if !scheduled.is_empty() {
                        debug!("recovery initiated, subinode={}", outpoint.short());
                        ask_budget -= 1;
                    }
                    inner.scheduled_recovery_connections.extend(scheduled);
                    inner
                        .recovery_requests
                        .insert(hash, (now + MNB_RECOVERY_WAIT_SECONDS, requested));
                }
                i += 1;
            }

            // Process replies for restart-required nodes.
            {
                let ManagerInner {
                    recovery_requests,
                    recovery_good_replies,
                    ..
                } = &mut *inner;
                recovery_good_replies.retain(|hash, replies| {
                    let deadline = recovery_requests
                        .get(hash)
                        .map(|(deadline, _)| *deadline)
                        .unwrap_or(0);
                    if deadline >= now {
                        return true;
                    }
                    // All nodes we asked should have replied by now.
                    if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
                        let mut replay = replies[0].clone();
                        replay.recovery = true;
                        recovery_replays.push(replay);
                    }
                    false
                });
            }

            // Allow re-verification after the retry window.
            inner
                .recovery_requests
                .retain(|_, (deadline, _)| now - *deadline <= MNB_RECOVERY_RETRY_SECONDS);

            inner.asked_us_for_list.retain(|_, t| *t >= now);
            inner.we_asked_for_list.retain(|_, t| *t >= now);
            for asked in inner.we_asked_for_entry.values_mut() {
                asked.retain(|_, t| *t >= now);
            }
            inner.we_asked_for_entry.retain(|_, asked| !asked.is_empty());

            if let Some(tip) = tip {
                inner
                    .we_asked_for_verification
                    .retain(|_, verify| verify.block_height >= tip - MAX_POSE_BLOCKS);
                inner
                    .seen_verifications
                    .retain(|_, verify| verify.block_height >= tip - MAX_POSE_BLOCKS);
            }

            // Announce sightings are cleaned on updates, pings by age.
            inner.seen_pings.retain(|_, ping| !ping.is_expired(now));

            if removed {
                self.check_and_rebuild_index_inner(&mut inner, now);
            }
        }

        for replay in recovery_replays {
            debug!("reprocessing recovery announce, subinode={}", replay.outpoint.short());
            let _ = self.check_announce_and_update(None, replay, payments);
        }
    }

    fn check_and_rebuild_index_inner(&self, inner: &mut ManagerInner, now: i64) {
        if now - inner.last_index_rebuild_time < MIN_INDEX_REBUILD_TIME {
            return;
        }
        if (inner.index.size() as usize) <= MAX_EXPECTED_INDEX_SIZE {
            return;
        }
        if inner.index.size() as usize <= inner.nodes.len() {
            return;
        }
        inner.old_index = inner.index.clone();
        inner.index.clear();
        let outpoints: Vec<OutPoint> = inner.nodes.iter().map(|n| n.outpoint).collect();
        for outpoint in outpoints {
            inner.index.insert(outpoint);
        }
        inner.index_rebuilt = true;
        inner.last_index_rebuild_time = now;
        info!("subinode index rebuilt, size {}", inner.index.size());
    }

    /// Drop the retired index after consumers acknowledged the rebuild.
    pub fn clear_old_index(&self) {
        let mut inner = self.inner.write();
        inner.old_index.clear();
        inner.index_rebuilt = false;
    }

    pub fn index_rebuilt(&self) -> bool {
        self.inner.read().index_rebuilt
    }

    // ---- directory traffic ----------------------------------------------

    /// Ask a peer for the full directory, at most once per window.
    pub fn dseg_update(&self, peer: &PeerInfo) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        if self.params.network.is_mainnet() && !peer.addr.is_local() {
            if let Some(&asked) = inner.we_asked_for_list.get(&peer.addr) {
                if now < asked {
                    debug!("already asked {} for the list, skipping", peer.addr);
                    return;
                }
            }
        }
        self.net
            .send_to(peer.id, opcode::DSEG, &OutPoint::default());
        inner
            .we_asked_for_list
            .insert(peer.addr, now + DSEG_UPDATE_SECONDS);
        debug!("asked {} for the subinode list", peer.addr);
    }

    /// Ask a peer for one node's announce.
    pub fn ask_for_node(&self, peer: &PeerInfo, outpoint: &OutPoint) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        self.ask_for_node_inner(&mut inner, peer, outpoint, now);
    }

    fn ask_for_node_inner(
        &self,
        inner: &mut ManagerInner,
        peer: &PeerInfo,
        outpoint: &OutPoint,
        now: i64,
    ) {
        let asked = inner.we_asked_for_entry.entry(*outpoint).or_default();
        if let Some(&t) = asked.get(&peer.addr) {
            if now < t {
                // Asked recently; repeating would get us banned.
                return;
            }
        }
        debug!(
            "asking {} for missing subinode entry {}",
            peer.addr,
            outpoint.short()
        );
        asked.insert(peer.addr, now + DSEG_UPDATE_SECONDS);
        self.net.send_to(peer.id, opcode::DSEG, outpoint);
    }

    /// Serve a directory request.
    pub fn handle_directory(&self, peer: &PeerInfo, filter: OutPoint) {
        // This one is heavy; ignore it until we finished our own sync.
        let tip = self.chain.tip_height().unwrap_or_default();
        if !self.sync.is_synced(tip) {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner.write();

        if filter.is_null() && !peer.addr.is_local() && self.params.network.is_mainnet() {
            if let Some(&asked) = inner.asked_us_for_list.get(&peer.addr) {
                if now < asked {
                    debug!("{} already asked for the list", peer.addr);
                    self.net.misbehaving(peer.id, 34);
                    return;
                }
            }
            inner
                .asked_us_for_list
                .insert(peer.addr, now + DSEG_UPDATE_SECONDS);
        }

        let mut sent = 0;
        let mut newly_seen = Vec::new();
        let mut served_single = false;
        for node in &inner.nodes {
            if !filter.is_null() && filter != node.outpoint {
                continue;
            }
            if node.addr.is_local() {
                continue; // never advertise local-network nodes
            }
            if node.is_update_required() {
                continue;
            }
            let announce = Announce::from_node(node);
            let hash = announce.hash();
            self.net.send_to(peer.id, opcode::MNANNOUNCE, &announce);
            self.net.send_to(peer.id, opcode::MNPING, &node.last_ping);
            if !inner.seen_announces.contains_key(&hash) {
                newly_seen.push((hash, announce));
            }
            sent += 1;
            if filter == node.outpoint {
                served_single = true;
                break;
            }
        }
        for (hash, announce) in newly_seen {
            inner.seen_announces.insert(hash, (now, announce));
        }
        if served_single {
            debug!("sent one subinode entry to {}", peer.addr);
            return;
        }
        if filter.is_null() {
            self.net
                .send_to(peer.id, opcode::SYNCSTATUSCOUNT, &(SYNC_ITEM_LIST, sent));
            debug!("sent {sent} subinode entries to {}", peer.addr);
        }
    }

    // ---- announce handling ----------------------------------------------

    pub fn handle_announce(
        &self,
        from: Option<&PeerInfo>,
        announce: Announce,
        payments: &dyn PaymentsView,
    ) {
        if !self.sync.is_blockchain_synced() {
            return;
        }
        if let Err(rejected) = self.check_announce_and_update(from, announce, payments) {
            debug!("announce rejected: {rejected}");
            if let Some(peer) = from {
                self.net.misbehaving(peer.id, rejected.dos);
            }
        }
    }

    /// Full announce acceptance: dedup, structural checks, supersession,
    /// collateral validation, insert and relay.
    pub fn check_announce_and_update(
        &self,
        from: Option<&PeerInfo>,
        announce: Announce,
        payments: &dyn PaymentsView,
    ) -> Result<bool, Rejected> {
        let now = self.clock.now();
        let min_proto = payments.min_payments_proto();
        let our_key = self.our_service_key();
        let hash = announce.hash();

        let mut inner = self.inner.write();
        let watchdog = self.watchdog_active_inner(&inner, now);
        let count = inner.nodes.len();
        let ctx = self.check_context(&our_key, min_proto, count, watchdog);

        if inner.seen_announces.contains_key(&hash) && !announce.recovery {
            // Seen before. Refresh the sighting when the node is about to
            // drop out of the recoverable window, so sync keeps moving.
            let entry = inner.seen_announces.get_mut(&hash).expect("checked");
            if now - entry.0 > NEW_START_REQUIRED_SECONDS - MIN_PING_SECONDS * 2 {
                entry.0 = now;
                self.events.emit(TierEvent::SubinodeListUpdated);
            }
            let seen_ping_time = entry.1.last_ping.sig_time;
            if let Some(peer) = from {
                let deadline_ok = inner
                    .recovery_requests
                    .get(&hash)
                    .map(|(deadline, _)| now < *deadline)
                    .unwrap_or(false);
                if deadline_ok {
                    let requested = inner
                        .recovery_requests
                        .get_mut(&hash)
                        .map(|(_, requested)| requested.remove(&peer.addr))
                        .unwrap_or(false);
                    // One reply per asked peer, and only if it knows a
                    // fresher ping and projects a recoverable state.
                    if requested && announce.last_ping.sig_time > seen_ping_time {
                        let mut probe = announce.to_node();
                        probe.check(true, &ctx);
                        if probe.state.valid_for_auto_start() {
                            debug!(
                                "good recovery reply for subinode={}",
                                announce.outpoint.short()
                            );
                            inner
                                .recovery_good_replies
                                .entry(hash)
                                .or_default()
                                .push(announce);
                        }
                    }
                }
            }
            return Ok(true);
        }
        inner.seen_announces.insert(hash, (now, announce.clone()));

        let install_state = announce.simple_check(self.params, min_proto, &*self.chain, now)?;

        if let Some(pos) = inner
            .nodes
            .iter()
            .position(|node| node.outpoint == announce.outpoint)
        {
            let old_hash = Announce::from_node(&inner.nodes[pos]).hash();
            let relayed = self.update_existing(&mut inner, pos, &announce, now, &ctx)?;
            if relayed && hash != old_hash {
                inner.seen_announces.remove(&old_hash);
            }
            return Ok(true);
        }

        // Brand new entry: the collateral must check out.
        if self.identity.is_service_node()
            && announce.outpoint == self.identity.outpoint()
            && self.identity.is_our_service_key(&announce.service_pubkey)
        {
            // Our own active announce; nothing to do here.
            return Err(Rejected::soft("own announce"));
        }
        match announce.check_outpoint(self.params, &*self.chain, SUBINODE_COLLATERAL) {
            Ok(()) => {}
            Err(OutpointCheck::Retry(reason)) => {
                // Maybe we are a few blocks behind; let it be checked again.
                inner.seen_announces.remove(&hash);
                return Err(Rejected::soft(reason));
            }
            Err(OutpointCheck::Rejected(rejected)) => return Err(rejected),
        }

        let mut node = announce.to_node();
        node.state = install_state;

        let ours = self.identity.is_our_service_key(&announce.service_pubkey);
        if ours {
            // Remote activation of our own node.
            node.pose_ban_score = -POSE_BAN_MAX_SCORE;
            if announce.protocol_version != PROTOCOL_VERSION {
                // We have to re-announce with the current protocol; do not
                // install or relay, and do not penalize the sender.
                return Err(Rejected::soft("own announce with stale protocol"));
            }
        }

        self.add_inner(&mut inner, node);
        inner.seen_pings.insert(announce.last_ping.hash(), announce.last_ping.clone());
        self.net.broadcast(opcode::MNANNOUNCE, &announce);
        Ok(true)
    }

    /// Supersession of an existing record by a newer announce.
    fn update_existing(
        &self,
        inner: &mut ManagerInner,
        pos: usize,
        announce: &Announce,
        now: i64,
        ctx: &CheckContext<'_>,
    ) -> Result<bool, Rejected> {
        {
            let node = &mut inner.nodes[pos];

            if node.announce_time == announce.sig_time && !announce.recovery {
                // Plain duplicate that slipped past the seen map on restart.
                return Ok(false);
            }
            if node.announce_time > announce.sig_time {
                return Err(Rejected::soft("announce older than the stored record"));
            }

            node.check(false, ctx);
            if node.is_pose_banned() {
                return Err(Rejected::soft("banned by proof-of-service"));
            }
            if node.collateral_pubkey != announce.collateral_pubkey {
                return Err(Rejected::new(33, "collateral key does not match outpoint"));
            }
            announce.verify_signature()?;
        }

        let ours = self.identity.is_our_service_key(&announce.service_pubkey);
        let recently_announced =
            inner.nodes[pos].is_announced_within(MIN_ANNOUNCE_SECONDS, now);
        if !recently_announced || ours {
            // Take the newest entry.
            debug!("updated subinode entry, addr={}", announce.addr);
            let updated =
                announce.apply_to(&mut inner.nodes[pos], &*self.chain, now, ctx.list_synced);
            if updated {
                inner
                    .seen_pings
                    .insert(announce.last_ping.hash(), announce.last_ping.clone());
                if ours {
                    inner.nodes[pos].pose_ban_score = -POSE_BAN_MAX_SCORE;
                }
                inner.nodes[pos].check(false, ctx);
                self.net.broadcast(opcode::MNANNOUNCE, announce);
            }
            self.events.emit(TierEvent::SubinodeListUpdated);
            return Ok(updated);
        }
        Ok(false)
    }

    /// Trusted local install (our own freshly created announce).
    pub fn update_subinode_list(&self, announce: Announce) {
        let now = self.clock.now();
        let our_key = self.our_service_key();
        let mut inner = self.inner.write();
        let watchdog = self.watchdog_active_inner(&inner, now);
        let count = inner.nodes.len();
        let ctx = self.check_context(&our_key, 0, count, watchdog);

        inner
            .seen_pings
            .insert(announce.last_ping.hash(), announce.last_ping.clone());
        inner
            .seen_announces
            .insert(announce.hash(), (now, announce.clone()));

        match inner
            .nodes
            .iter()
            .position(|node| node.outpoint == announce.outpoint)
        {
            None => {
                self.add_inner(&mut inner, announce.to_node());
            }
            Some(pos) => {
                let old_hash = Announce::from_node(&inner.nodes[pos]).hash();
                if announce.apply_to(&mut inner.nodes[pos], &*self.chain, now, ctx.list_synced) {
                    self.events.emit(TierEvent::SubinodeListUpdated);
                    inner.seen_announces.remove(&old_hash);
                }
            }
        }
    }

    // ---- ping handling ----------------------------------------------------

    pub fn handle_ping(&self, from: Option<&PeerInfo>, ping: Ping, payments: &dyn PaymentsView) {
        if !self.sync.is_blockchain_synced() {
            return;
        }
        let now = self.clock.now();
        let our_key = self.our_service_key();
        let min_proto = payments.min_payments_proto();
        let hash = ping.hash();

        let mut inner = self.inner.write();
        if inner.seen_pings.contains_key(&hash) {
            return;
        }
        inner.seen_pings.insert(hash, ping.clone());
        debug!("new subinode ping, subinode={}", ping.outpoint.short());

        let watchdog = self.watchdog_active_inner(&inner, now);
        let count = inner.nodes.len();
        let ctx = self.check_context(&our_key, min_proto, count, watchdog);

        let pos = inner
            .nodes
            .iter()
            .position(|node| node.outpoint == ping.outpoint);

        // Too late for pings; a fresh announce is required.
        if let Some(pos) = pos {
            if inner.nodes[pos].is_new_start_required() {
                return;
            }
        }

        let list_synced = self.sync.is_list_synced();
        let node_ref = match pos {
            Some(p) => inner.nodes.get_mut(p),
            None => None,
        };
        let result = ping.check_and_update(node_ref, false, &*self.chain, now, list_synced);

        match result {
            Ok(update) => {
                if update.bump_sync {
                    self.events.emit(TierEvent::SubinodeListUpdated);
                }
                let pos = pos.expect("accepted pings have a record");
                let announce_hash = Announce::from_node(&inner.nodes[pos]).hash();
                if let Some(entry) = inner.seen_announces.get_mut(&announce_hash) {
                    entry.1.last_ping = ping.clone();
                }
                inner.nodes[pos].check(true, &ctx);
                if inner.nodes[pos].is_enabled() {
                    self.net.broadcast(opcode::MNPING, &ping);
                }
            }
            Err(rejected) => {
                if rejected.dos > 0 {
                    if let Some(peer) = from {
                        self.net.misbehaving(peer.id, rejected.dos);
                    }
                } else if pos.is_some() {
                    // Nothing significant failed and the node is known.
                    return;
                }
                // Something is broken or the node is unknown; ask once.
                if let Some(peer) = from {
                    self.ask_for_node_inner(&mut inner, peer, &ping.outpoint, now);
                }
            }
        }
    }

    // ---- proof-of-service -------------------------------------------------

    pub fn handle_verify(&self, peer: &PeerInfo, verify: Verify, payments: &dyn PaymentsView) {
        if !self.sync.is_blockchain_synced() {
            return;
        }
        if verify.is_request() {
            // Someone asks us to prove the address we are using.
            self.send_verify_reply(peer, verify);
        } else if verify.is_reply() {
            // Probably the verification we requested.
            self.process_verify_reply(peer, verify);
        } else {
            // A countersigned attestation from some verifier.
            self.process_verify_broadcast(peer, verify, payments);
        }
    }

    fn send_verify_reply(&self, peer: &PeerInfo, mut verify: Verify) {
        // Only subinodes can sign these; a regular node asked by mistake
        // (or a malicious peer borrowing our address) is just ignored.
        if !self.identity.is_service_node() {
            return;
        }
        let now = self.clock.now();
        if self.fulfilled.has(&peer.addr, "mnv-reply", now) {
            debug!("peer {} asked to verify us too often", peer.addr);
            self.net.misbehaving(peer.id, 20);
            return;
        }
        let Some(block_hash) = self.chain.block_hash(verify.block_height) else {
            debug!(
                "can't get block hash for height {}, peer {}",
                verify.block_height, peer.addr
            );
            return;
        };
        let Some(our_addr) = self.identity.addr() else {
            return;
        };
        let Some(key) = self.identity.service_key() else {
            return;
        };

        let message = format!("{}{}{}", our_addr, verify.nonce, block_hash.hex());
        let Ok(sig) = subi_crypto::sign_message(&key, &message) else {
            warn!("failed to sign verify reply");
            return;
        };
        verify.sig1 = sig;
        if subi_crypto::verify_message(&self.identity.service_pubkey(), &verify.sig1, &message)
            .is_err()
        {
            warn!("verify reply self-check failed");
            return;
        }

        self.net.send_to(peer.id, opcode::MNVERIFY, &verify);
        self.fulfilled.add(peer.addr, "mnv-reply", now);
    }

    fn process_verify_reply(&self, peer: &PeerInfo, verify: Verify) {
        let now = self.clock.now();

        // Did we even ask for it?
        if !self.fulfilled.has(&peer.addr, "mnv-request", now) {
            debug!("unsolicited verify reply from {}", peer.addr);
            self.net.misbehaving(peer.id, 20);
            return;
        }
        {
            let inner = self.inner.read();
            let Some(pending) = inner.we_asked_for_verification.get(&peer.addr) else {
                self.net.misbehaving(peer.id, 20);
                return;
            };
            if pending.nonce != verify.nonce || pending.block_height != verify.block_height {
                debug!("verify reply does not match our request, peer {}", peer.addr);
                self.net.misbehaving(peer.id, 20);
                return;
            }
        }
        let Some(block_hash) = self.chain.block_hash(verify.block_height) else {
            return;
        };
        if self.fulfilled.has(&peer.addr, "mnv-done", now) {
            debug!("already verified {} recently", peer.addr);
            self.net.misbehaving(peer.id, 20);
            return;
        }

        let our_outpoint = self.identity.outpoint();
        let our_key = self.identity.service_key();
        let message1 = format!("{}{}{}", peer.addr, verify.nonce, block_hash.hex());

        let mut inner = self.inner.write();
        let mut real: Option<usize> = None;
        let mut to_ban: Vec<usize> = Vec::new();
        let mut broadcast: Option<Verify> = None;

        for idx in 0..inner.nodes.len() {
            if inner.nodes[idx].addr != peer.addr {
                continue;
            }
            let service_pubkey = inner.nodes[idx].service_pubkey.clone();
            if subi_crypto::verify_message(&service_pubkey, &verify.sig1, &message1).is_ok() {
                real = Some(idx);
                if !inner.nodes[idx].is_pose_verified() {
                    inner.nodes[idx].decrease_pose_ban_score();
                }
                self.fulfilled.add(peer.addr, "mnv-done", now);

                // Only an activated subinode may countersign and publish.
                if our_outpoint.is_null() {
                    continue;
                }
                let Some(key) = our_key.as_ref() else { continue };
                let mut attested = verify.clone();
                attested.addr = inner.nodes[idx].addr;
                attested.vin1 = inner.nodes[idx].outpoint;
                attested.vin2 = our_outpoint;
                let message2 = attested.broadcast_message(&block_hash);
                let Ok(sig2) = subi_crypto::sign_message(key, &message2) else {
                    warn!("failed to countersign verify broadcast");
                    return;
                };
                attested.sig2 = sig2;
                if subi_crypto::verify_message(
                    &self.identity.service_pubkey(),
                    &attested.sig2,
                    &message2,
                )
                .is_err()
                {
                    warn!("verify broadcast self-check failed");
                    return;
                }
                inner
                    .we_asked_for_verification
                    .insert(peer.addr, attested.clone());
                broadcast = Some(attested);
            } else {
                to_ban.push(idx);
            }
        }

        let Some(real) = real else {
            // Nobody at this address could sign: someone is playing games.
            debug!("no real subinode found for addr {}", peer.addr);
            self.net.misbehaving(peer.id, 20);
            return;
        };
        debug!(
            "verified real subinode {} for addr {}",
            inner.nodes[real].outpoint.short(),
            peer.addr
        );
        for idx in to_ban {
            inner.nodes[idx].increase_pose_ban_score();
        }
        if let Some(attested) = broadcast {
            self.net.broadcast(opcode::MNVERIFY, &attested);
        }
    }

    fn process_verify_broadcast(
        &self,
        peer: &PeerInfo,
        verify: Verify,
        payments: &dyn PaymentsView,
    ) {
        let hash = verify.hash();
        {
            let mut inner = self.inner.write();
            if inner.seen_verifications.contains_key(&hash) {
                return;
            }
            inner.seen_verifications.insert(hash, verify.clone());
        }

        let tip = self.chain.tip_height().unwrap_or_default();
        if verify.block_height < tip - MAX_POSE_BLOCKS {
            debug!(
                "outdated verify broadcast: tip {tip}, verification block {}",
                verify.block_height
            );
            return;
        }
        if verify.vin1 == verify.vin2 {
            // Cheating by verifying itself; ban the relaying peer.
            self.net.misbehaving(peer.id, 100);
            return;
        }
        let Some(block_hash) = self.chain.block_hash(verify.block_height) else {
            return;
        };

        let min_proto = payments.min_payments_proto();
        let rank = self.rank(&verify.vin2, verify.block_height, min_proto, false);
        if rank == -1 {
            debug!(
                "can't calculate rank for subinode {}",
                verify.vin2.short()
            );
            return;
        }
        if rank > MAX_POSE_RANK {
            debug!(
                "subinode {} is not in the top {MAX_POSE_RANK} (rank {rank})",
                verify.vin2.short()
            );
            return;
        }

        let message1 = verify.reply_message(&block_hash);
        let message2 = verify.broadcast_message(&block_hash);

        let mut inner = self.inner.write();
        let Some(pos1) = inner
            .nodes
            .iter()
            .position(|n| n.outpoint == verify.vin1)
        else {
            debug!("can't find verified subinode {}", verify.vin1.short());
            return;
        };
        let Some(pos2) = inner
            .nodes
            .iter()
            .position(|n| n.outpoint == verify.vin2)
        else {
            debug!("can't find verifier subinode {}", verify.vin2.short());
            return;
        };
        if inner.nodes[pos1].addr != verify.addr {
            debug!("verify addr {} does not match the record", verify.addr);
            return;
        }
        if subi_crypto::verify_message(
            &inner.nodes[pos1].service_pubkey,
            &verify.sig1,
            &message1,
        )
        .is_err()
        {
            debug!("verify broadcast: bad signature from the verified node");
            return;
        }
        if subi_crypto::verify_message(
            &inner.nodes[pos2].service_pubkey,
            &verify.sig2,
            &message2,
        )
        .is_err()
        {
            debug!("verify broadcast: bad countersignature from the verifier");
            return;
        }

        if !inner.nodes[pos1].is_pose_verified() {
            inner.nodes[pos1].decrease_pose_ban_score();
        }
        self.net.broadcast(opcode::MNVERIFY, &verify);

        // Everyone else claiming this address is an impostor.
        let addr = verify.addr;
        let verified_outpoint = verify.vin1;
        let mut banned = 0;
        for node in inner.nodes.iter_mut() {
            if node.addr != addr || node.outpoint == verified_outpoint {
                continue;
            }
            node.increase_pose_ban_score();
            banned += 1;
        }
        debug!(
            "verified subinode {} for addr {addr}, score increased for {banned} impostors",
            verified_outpoint.short()
        );
    }

    /// Periodic proof-of-service fan-out: challenge up to
    /// [`MAX_POSE_CONNECTIONS`] nodes ranked below us.
    pub fn do_full_verification_step(&self, payments: &dyn PaymentsView) {
        if self.identity.outpoint().is_null() {
            return;
        }
        let tip = match self.chain.tip_height() {
            Some(tip) => tip,
            None => return,
        };
        if !self.sync.is_synced(tip) {
            return;
        }

        let min_proto = payments.min_payments_proto();
        let ranks = self.ranks(tip - 1, min_proto);

        // Send requests only if we are in the top of the list ourselves.
        let our_outpoint = self.identity.outpoint();
        let my_rank = match ranks
            .iter()
            .find(|(_, info)| info.outpoint == our_outpoint)
        {
            Some((rank, _)) if *rank <= MAX_POSE_RANK => *rank,
            _ => return,
        };

        let now = self.clock.now();
        let mut offset = (MAX_POSE_RANK + my_rank - 1) as usize;
        if offset >= ranks.len() {
            return;
        }
        let mut sent = 0;
        while offset < ranks.len() {
            let (_, info) = &ranks[offset];
            if info.is_pose_verified() || info.is_pose_banned() {
                offset += MAX_POSE_CONNECTIONS;
                continue;
            }
            if self.send_verify_request(info.addr, tip - 1, now) {
                sent += 1;
                if sent >= MAX_POSE_CONNECTIONS {
                    break;
                }
            }
            offset += MAX_POSE_CONNECTIONS;
        }
        debug!("sent verification requests to {sent} subinodes");
    }

    fn send_verify_request(&self, addr: NetAddress, height: BlockHeight, now: i64) -> bool {
        if self.fulfilled.has(&addr, "mnv-request", now) {
            // Asked recently; doing this too often is a good way to get banned.
            return false;
        }
        let nonce = rand::thread_rng().gen_range(1..=999_999u32);
        let verify = Verify::request(addr, nonce, height);
        {
            let mut inner = self.inner.write();
            inner.we_asked_for_verification.insert(addr, verify.clone());
        }
        self.fulfilled.add(addr, "mnv-request", now);
        debug!("verifying node using nonce {nonce}, addr={addr}");
        self.net.connect_and_send(
            addr,
            vec![WirePayload::encode(opcode::MNVERIFY, &verify)],
        );
        true
    }

    /// Sort nodes by address; inside a run of equal addresses a verified
    /// node condemns every other one. With no verified node in the run,
    /// nobody is banned yet.
    pub fn check_same_addr(&self) {
        let tip = self.chain.tip_height().unwrap_or_default();
        if !self.sync.is_synced(tip) {
            return;
        }
        let mut inner = self.inner.write();
        if inner.nodes.is_empty() {
            return;
        }

        let mut order: Vec<usize> = (0..inner.nodes.len())
            .filter(|&i| inner.nodes[i].is_enabled() || inner.nodes[i].is_pre_enabled())
            .collect();
        order.sort_by(|&a, &b| inner.nodes[a].addr.cmp(&inner.nodes[b].addr));

        let mut to_ban: Vec<usize> = Vec::new();
        let mut prev: Option<usize> = None;
        let mut verified: Option<usize> = None;
        for &idx in &order {
            match prev {
                None => {
                    verified = inner.nodes[idx].is_pose_verified().then_some(idx);
                }
                Some(prev_idx) => {
                    if inner.nodes[idx].addr == inner.nodes[prev_idx].addr {
                        if verified.is_some() {
                            // Another node at this address is verified.
                            to_ban.push(idx);
                        } else if inner.nodes[idx].is_pose_verified() {
                            // This one is verified; condemn the earlier run.
                            to_ban.push(prev_idx);
                            verified = Some(idx);
                        }
                    } else {
                        verified = inner.nodes[idx].is_pose_verified().then_some(idx);
                    }
                }
            }
            prev = Some(idx);
        }

        for idx in to_ban {
            debug!(
                "increasing proof-of-service ban score for duplicate-address subinode {}",
                inner.nodes[idx].outpoint.short()
            );
            inner.nodes[idx].increase_pose_ban_score();
        }
    }

    // ---- ranking and payment queue -----------------------------------------

    fn ranks_inner(
        &self,
        inner: &ManagerInner,
        height: BlockHeight,
        min_proto: i32,
    ) -> Vec<(i64, SubinodeInfo)> {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return Vec::new();
        };
        let mut scored: Vec<(U256, &Subinode)> = inner
            .nodes
            .iter()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .map(|node| (node.score(&block_hash), node))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.outpoint.cmp(&a.1.outpoint)));
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, node))| ((i + 1) as i64, node.info()))
            .collect()
    }

    /// Nodes ordered by descending score against the block hash at
    /// `height`. Empty when the block hash is unknown.
    pub fn ranks(&self, height: BlockHeight, min_proto: i32) -> Vec<(i64, SubinodeInfo)> {
        let inner = self.inner.read();
        self.ranks_inner(&inner, height, min_proto)
    }

    /// Rank of one node, -1 when it does not qualify or the hash is unknown.
    pub fn rank(
        &self,
        outpoint: &OutPoint,
        height: BlockHeight,
        min_proto: i32,
        only_active: bool,
    ) -> i64 {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return -1;
        };
        let inner = self.inner.read();
        let mut scored: Vec<(U256, &Subinode)> = inner
            .nodes
            .iter()
            .filter(|node| {
                node.protocol_version >= min_proto
                    && if only_active {
                        node.is_enabled()
                    } else {
                        node.is_valid_for_payment()
                    }
            })
            .map(|node| (node.score(&block_hash), node))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.outpoint.cmp(&a.1.outpoint)));
        for (i, (_, node)) in scored.iter().enumerate() {
            if node.outpoint == *outpoint {
                return (i + 1) as i64;
            }
        }
        -1
    }

    pub fn node_by_rank(
        &self,
        rank: i64,
        height: BlockHeight,
        min_proto: i32,
    ) -> Option<SubinodeInfo> {
        self.ranks(height, min_proto)
            .into_iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, info)| info)
    }

    fn not_qualify_reason(
        node: &mut Subinode,
        payments: &dyn PaymentsView,
        chain: &dyn ChainView,
        height: BlockHeight,
        filter_sig_time: bool,
        enabled_count: usize,
        now: i64,
        tip: BlockHeight,
    ) -> Option<&'static str> {
        if !node.is_valid_for_payment() {
            return Some("not valid for payment");
        }
        if node.protocol_version < payments.min_payments_proto() {
            return Some("protocol version too old");
        }
        // Scheduled in the lookahead window already; skip it.
        if payments.is_scheduled(&node.payee(), height) {
            return Some("already scheduled");
        }
        // Too new; wait for a full cycle.
        if filter_sig_time && node.announce_time + (enabled_count as i64) * 156 > now {
            return Some("too new");
        }
        // The collateral needs at least as many confirmations as there are
        // subinodes.
        if node.collateral_age(chain, tip) < enabled_count as i64 {
            return Some("collateral too shallow");
        }
        None
    }

    /// Deterministically select the next node to pay: the oldest-unpaid
    /// tenth of the network, decided by score against `height - 100`.
    pub fn next_in_queue_for_payment(
        &self,
        height: BlockHeight,
        filter_sig_time: bool,
        payments: &dyn PaymentsView,
    ) -> (Option<SubinodeInfo>, usize) {
        let Some(block_hash) = self.chain.block_hash(height - 100) else {
            warn!("no block hash at height {}", height - 100);
            return (None, 0);
        };
        let now = self.clock.now();
        let tip = self.chain.tip_height().unwrap_or_default();
        let min_proto = payments.min_payments_proto();

        let mut inner = self.inner.write();
        let enabled_count = inner
            .nodes
            .iter()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .count();

        let mut filter = filter_sig_time;
        loop {
            let mut candidates: Vec<(BlockHeight, OutPoint, usize)> = Vec::new();
            for (idx, node) in inner.nodes.iter_mut().enumerate() {
                if let Some(reason) = Self::not_qualify_reason(
                    node,
                    payments,
                    &*self.chain,
                    height,
                    filter,
                    enabled_count,
                    now,
                    tip,
                ) {
                    debug!("subinode {} does not qualify: {reason}", node.outpoint.short());
                    continue;
                }
                candidates.push((node.last_paid_block, node.outpoint, idx));
            }
            let count = candidates.len();

            // When the network is upgrading, don't punish freshly restarted
            // nodes: retry once without the age filter.
            if filter && count < enabled_count / 3 {
                filter = false;
                continue;
            }

            candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

            // Look at the oldest-paid tenth and pay the best scored one.
            let tenth = enabled_count / 10;
            let mut best: Option<(U256, usize)> = None;
            for (seen, (_, outpoint, idx)) in candidates.iter().enumerate() {
                let score = crate::score_for_outpoint(outpoint, &block_hash);
                if best.map(|(high, _)| score > high).unwrap_or(true) {
                    best = Some((score, *idx));
                }
                if seen + 1 >= tenth {
                    break;
                }
            }
            return (best.map(|(_, idx)| inner.nodes[idx].info()), count);
        }
    }

    /// Refresh every node's last-paid data from recent blocks.
    pub fn update_last_paid(&self, payments: &dyn PaymentsView, schedule: &dyn PaymentSchedule) {
        let tip = match self.chain.tip_height() {
            Some(tip) => tip,
            None => return,
        };
        // Full scan on the first pass or for non-subinodes; ours keep up
        // block by block, a bounded scan is enough for them. Resolved
        // before taking the lock: the storage limit reads the node count.
        let first_scan = self.inner.read().first_paid_scan;
        let max_scan_back = if first_scan || !self.identity.is_service_node() {
            payments.storage_limit()
        } else {
            LAST_PAID_SCAN_BLOCKS
        };
        let mut inner = self.inner.write();
        for node in inner.nodes.iter_mut() {
            node.update_last_paid(&*self.chain, schedule, payments, tip, max_scan_back);
        }
        // Every run is like the first one until the winners list is in.
        inner.first_paid_scan = !self.sync.is_winners_synced();
    }

    // ---- recovery connection queue ------------------------------------------

    /// Pop the scheduled recovery probes for one address.
    pub fn pop_scheduled_connection(&self) -> Option<(NetAddress, Vec<OutPoint>)> {
        let mut inner = self.inner.write();
        inner.scheduled_recovery_connections.sort();
        let (addr, _) = *inner.scheduled_recovery_connections.first()?;
        let mut outpoints = Vec::new();
        inner.scheduled_recovery_connections.retain(|(a, outpoint)| {
            if *a == addr {
                outpoints.push(*outpoint);
                false
            } else {
                true
            }
        });
        outpoints.dedup();
        Some((addr, outpoints))
    }

    pub fn is_recovery_requested(&self, hash: &Hash256) -> bool {
        self.inner.read().recovery_requests.contains_key(hash)
    }

    /// Install the pending-verification state the fan-out step would have
    /// left behind, so reply handling can be exercised in isolation.
    #[cfg(test)]
    pub fn seed_pending_verification(&self, addr: NetAddress, verify: Verify) {
        let now = self.clock.now();
        self.inner
            .write()
            .we_asked_for_verification
            .insert(addr, verify);
        self.fulfilled.add(addr, "mnv-request", now);
    }

    // ---- tip callback ---------------------------------------------------------

    pub fn updated_block_tip(
        &self,
        height: BlockHeight,
        payments: &dyn PaymentsView,
        schedule: &dyn PaymentSchedule,
    ) {
        {
            let mut inner = self.inner.write();
            inner.tip_height = Some(height);
        }
        debug!("subinode manager sees new tip {height}");
        self.check_same_addr();
        if self.identity.is_service_node() {
            // Regular wallets refresh this on demand instead.
            self.update_last_paid(payments, schedule);
        }
    }

    // ---- persistence ------------------------------------------------------------

    pub fn dump(&self, path: &Path) -> std::io::Result<()> {
        let dump = self.export_dump();
        store::save_dump(path, SERIALIZATION_VERSION, &dump)
    }

    pub fn load(&self, path: &Path) -> bool {
        match store::load_dump::<ManagerDump>(path, SERIALIZATION_VERSION) {
            Some(dump) => {
                self.import_dump(dump);
                true
            }
            None => {
                self.clear();
                false
            }
        }
    }

    pub fn export_dump(&self) -> ManagerDump {
        let inner = self.inner.read();
        ManagerDump {
            nodes: inner.nodes.clone(),
            asked_us_for_list: inner.asked_us_for_list.clone(),
            we_asked_for_list: inner.we_asked_for_list.clone(),
            we_asked_for_entry: inner.we_asked_for_entry.clone(),
            recovery_requests: inner
                .recovery_requests
                .iter()
                .map(|(h, (t, set))| (*h, (*t, set.iter().copied().collect())))
                .collect(),
            recovery_good_replies: inner.recovery_good_replies.clone(),
            last_watchdog_vote_time: inner.last_watchdog_vote_time,
            dsq_count: inner.dsq_count,
            seen_announces: inner.seen_announces.clone(),
            seen_pings: inner.seen_pings.clone(),
            index: inner.index.clone(),
        }
    }

    pub fn import_dump(&self, dump: ManagerDump) {
        let mut inner = self.inner.write();
        inner.nodes = dump.nodes;
        inner.asked_us_for_list = dump.asked_us_for_list;
        inner.we_asked_for_list = dump.we_asked_for_list;
        inner.we_asked_for_entry = dump.we_asked_for_entry;
        inner.recovery_requests = dump
            .recovery_requests
            .into_iter()
            .map(|(h, (t, set))| (h, (t, set.into_iter().collect())))
            .collect();
        inner.recovery_good_replies = dump.recovery_good_replies;
        inner.last_watchdog_vote_time = dump.last_watchdog_vote_time;
        inner.dsq_count = dump.dsq_count;
        inner.seen_announces = dump.seen_announces;
        inner.seen_pings = dump.seen_pings;
        inner.index = dump.index;
        inner.index.rebuild_reverse();
    }
}

impl fmt::Display for SubinodeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        write!(
            f,
            "Subinodes: {}, peers who asked us for the list: {}, peers we asked for the list: {}, entries we asked for: {}, index size: {}, dsq count: {}",
            inner.nodes.len(),
            inner.asked_us_for_list.len(),
            inner.we_asked_for_list.len(),
            inner.we_asked_for_entry.len(),
            inner.index.size(),
            inner.dsq_count,
        )
    }
}

/// Serializable snapshot of the manager, written to `subinodes.dat`.
#[derive(Serialize, Deserialize)]
pub struct ManagerDump {
    pub nodes: Vec<Subinode>,
    pub asked_us_for_list: HashMap<NetAddress, i64>,
    pub we_asked_for_list: HashMap<NetAddress, i64>,
    pub we_asked_for_entry: HashMap<OutPoint, HashMap<NetAddress, i64>>,
    pub recovery_requests: Vec<(Hash256, (i64, Vec<NetAddress>))>,
    pub recovery_good_replies: HashMap<Hash256, Vec<Announce>>,
    pub last_watchdog_vote_time: i64,
    pub dsq_count: i64,
    pub seen_announces: HashMap<Hash256, (i64, Announce)>,
    pub seen_pings: HashMap<Hash256, Ping>,
    pub index: SubinodeIndex,
}
