// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{
    Ping, CHECK_SECONDS, EXPIRATION_SECONDS, MIN_PING_SECONDS, NEW_START_REQUIRED_SECONDS,
    POSE_BAN_MAX_SCORE, WATCHDOG_MAX_SECONDS,
};
use ethereum_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use subi_chain::{ChainView, PaymentSchedule};
use subi_types::{
    sha256d, BlockHash, BlockHeight, MsgSignature, NetAddress, OutPoint, PubKey, Script,
};

/// Liveness state of a subinode record.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SubinodeState {
    PreEnabled,
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    WatchdogExpired,
    NewStartRequired,
    PoSeBanned,
}

impl SubinodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubinodeState::PreEnabled => "PRE_ENABLED",
            SubinodeState::Enabled => "ENABLED",
            SubinodeState::Expired => "EXPIRED",
            SubinodeState::OutpointSpent => "OUTPOINT_SPENT",
            SubinodeState::UpdateRequired => "UPDATE_REQUIRED",
            SubinodeState::WatchdogExpired => "WATCHDOG_EXPIRED",
            SubinodeState::NewStartRequired => "NEW_START_REQUIRED",
            SubinodeState::PoSeBanned => "POSE_BAN",
        }
    }

    /// States from which the active-self controller may resume without a
    /// fresh announce.
    pub fn valid_for_auto_start(self) -> bool {
        matches!(
            self,
            SubinodeState::Enabled
                | SubinodeState::PreEnabled
                | SubinodeState::Expired
                | SubinodeState::WatchdogExpired
        )
    }
}

impl fmt::Display for SubinodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the state machine consults on a check pass. Collected once by the
/// manager so individual records never reach for the singletons themselves.
pub struct CheckContext<'a> {
    pub now: i64,
    pub tip_height: Option<BlockHeight>,
    pub chain: &'a dyn ChainView,
    /// Minimum protocol eligible for payment right now.
    pub min_payments_proto: i32,
    /// Protocol version this build speaks.
    pub protocol_version: i32,
    /// Whether the directory sync stage has completed.
    pub list_synced: bool,
    /// Whether the watchdog is live (full sync done and voting recently).
    pub watchdog_active: bool,
    /// Our own service key when this process is a subinode.
    pub our_service_pubkey: Option<&'a PubKey>,
    /// Current node count, sets the PoSe ban span.
    pub node_count: usize,
}

/// One known subinode, keyed by its collateral outpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subinode {
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub collateral_pubkey: PubKey,
    pub service_pubkey: PubKey,
    pub last_ping: Ping,
    pub announce_sig: MsgSignature,
    pub announce_time: i64,
    pub last_dsq: i64,
    pub last_checked_time: i64,
    pub last_paid_time: i64,
    pub last_watchdog_vote_time: i64,
    pub state: SubinodeState,
    pub cached_collateral_block: BlockHeight,
    pub last_paid_block: BlockHeight,
    pub protocol_version: i32,
    pub pose_ban_score: i32,
    pub pose_ban_until_height: BlockHeight,
}

impl Subinode {
    pub fn new(
        addr: NetAddress,
        outpoint: OutPoint,
        collateral_pubkey: PubKey,
        service_pubkey: PubKey,
        protocol_version: i32,
        announce_time: i64,
    ) -> Self {
        Subinode {
            outpoint,
            addr,
            collateral_pubkey,
            service_pubkey,
            last_ping: Ping::default(),
            announce_sig: MsgSignature::default(),
            announce_time,
            last_dsq: 0,
            last_checked_time: 0,
            last_paid_time: 0,
            last_watchdog_vote_time: 0,
            state: SubinodeState::PreEnabled,
            cached_collateral_block: 0,
            last_paid_block: 0,
            protocol_version,
            pose_ban_score: 0,
            pose_ban_until_height: 0,
        }
    }

    /// The script this node is paid through.
    pub fn payee(&self) -> Script {
        Script::pay_to_key_id(&self.collateral_pubkey.key_id())
    }

    pub fn is_enabled(&self) -> bool {
        self.state == SubinodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == SubinodeState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == SubinodeState::PoSeBanned
    }

    /// Relies on the score, not the state, like every consumer of the
    /// cross-verification result.
    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -POSE_BAN_MAX_SCORE
    }

    pub fn is_expired(&self) -> bool {
        self.state == SubinodeState::Expired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == SubinodeState::OutpointSpent
    }

    pub fn is_update_required(&self) -> bool {
        self.state == SubinodeState::UpdateRequired
    }

    pub fn is_watchdog_expired(&self) -> bool {
        self.state == SubinodeState::WatchdogExpired
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == SubinodeState::NewStartRequired
    }

    /// Only fully enabled nodes are candidates for payment.
    pub fn is_valid_for_payment(&self) -> bool {
        self.state == SubinodeState::Enabled
    }

    pub fn is_announced_within(&self, seconds: i64, now: i64) -> bool {
        now - self.announce_time < seconds
    }

    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        if self.last_ping.is_empty() {
            return false;
        }
        at - self.last_ping.sig_time < seconds
    }

    pub fn increase_pose_ban_score(&mut self) {
        if self.pose_ban_score < POSE_BAN_MAX_SCORE {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        if self.pose_ban_score > -POSE_BAN_MAX_SCORE {
            self.pose_ban_score -= 1;
        }
    }

    /// Deterministic rank score for a block hash. The further the node hash
    /// lands from the block hash the better; every node must compute the
    /// identical value.
    pub fn score(&self, block_hash: &BlockHash) -> U256 {
        score_for_outpoint(&self.outpoint, block_hash)
    }

    /// Evaluate state transitions. Throttled to once per [`CHECK_SECONDS`]
    /// unless forced; idempotent for a fixed context.
    pub fn check(&mut self, force: bool, ctx: &CheckContext<'_>) {
        if !force && ctx.now - self.last_checked_time < CHECK_SECONDS {
            return;
        }
        self.last_checked_time = ctx.now;

        // Once spent, stop doing the checks.
        if self.is_outpoint_spent() {
            return;
        }

        if ctx.chain.utxo(&self.outpoint).is_none() {
            self.state = SubinodeState::OutpointSpent;
            return;
        }
        let height = ctx.tip_height.unwrap_or_default();

        if self.is_pose_banned() {
            if height < self.pose_ban_until_height {
                return;
            }
            // Served the ban span; let it earn its way back through the
            // usual checks. It stays on the edge and can be banned again
            // if it keeps failing verification.
            self.decrease_pose_ban_score();
        } else if self.pose_ban_score >= POSE_BAN_MAX_SCORE {
            self.state = SubinodeState::PoSeBanned;
            // Ban for a whole payment cycle.
            self.pose_ban_until_height = height + ctx.node_count as BlockHeight;
            return;
        }

        let ours = ctx
            .our_service_pubkey
            .map(|key| *key == self.service_pubkey)
            .unwrap_or(false);

        let requires_update = self.protocol_version < ctx.min_payments_proto
            || (ours && self.protocol_version < ctx.protocol_version);
        if requires_update {
            self.state = SubinodeState::UpdateRequired;
            return;
        }

        // Keep old nodes on start, give them a chance to receive updates.
        let wait_for_ping = !ctx.list_synced && !self.is_pinged_within(MIN_PING_SECONDS, ctx.now);
        if wait_for_ping && !ours {
            if self.is_expired() || self.is_watchdog_expired() || self.is_new_start_required() {
                return;
            }
        }

        if !wait_for_ping || ours {
            if !self.is_pinged_within(NEW_START_REQUIRED_SECONDS, ctx.now) {
                self.state = SubinodeState::NewStartRequired;
                return;
            }

            let watchdog_expired = ctx.watchdog_active
                && ctx.now - self.last_watchdog_vote_time > WATCHDOG_MAX_SECONDS;
            if watchdog_expired {
                self.state = SubinodeState::WatchdogExpired;
                return;
            }

            if !self.is_pinged_within(EXPIRATION_SECONDS, ctx.now) {
                self.state = SubinodeState::Expired;
                return;
            }
        }

        if self.last_ping.sig_time - self.announce_time < MIN_PING_SECONDS {
            self.state = SubinodeState::PreEnabled;
            return;
        }

        self.state = SubinodeState::Enabled;
    }

    /// Age of the collateral in blocks, caching the collateral height on
    /// first use. Negative when the chain cannot answer.
    pub fn collateral_age(&mut self, chain: &dyn ChainView, tip: BlockHeight) -> i64 {
        if self.cached_collateral_block == 0 {
            match chain.utxo(&self.outpoint) {
                Some(coin) => self.cached_collateral_block = coin.height,
                None => return -1,
            }
        }
        tip - self.cached_collateral_block
    }

    /// Scan recent blocks for the latest payment to this node's payee.
    pub fn update_last_paid(
        &mut self,
        chain: &dyn ChainView,
        schedule: &dyn PaymentSchedule,
        payees: &dyn crate::PaymentsView,
        tip: BlockHeight,
        max_scan_back: i64,
    ) {
        let payee = self.payee();
        let floor = (tip - max_scan_back).max(self.last_paid_block + 1).max(0);
        let mut height = tip;
        while height >= floor {
            if payees.has_payee_with_votes(height, &payee, 2) {
                if let Some(coinbase) = chain.coinbase(height) {
                    let payment = schedule.subinode_payment(height, coinbase.total_out());
                    if coinbase.pays(&payee, payment) {
                        self.last_paid_block = height;
                        self.last_paid_time = chain.block_time(height).unwrap_or_default();
                        return;
                    }
                }
            }
            height -= 1;
        }
        // No payment found in the window; keep the old values.
    }

    pub fn update_watchdog_vote_time(&mut self, now: i64) {
        self.last_watchdog_vote_time = now;
    }

    /// Copy-out snapshot handed across component boundaries.
    pub fn info(&self) -> SubinodeInfo {
        SubinodeInfo {
            outpoint: self.outpoint,
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey.clone(),
            service_pubkey: self.service_pubkey.clone(),
            announce_time: self.announce_time,
            last_dsq: self.last_dsq,
            last_checked_time: self.last_checked_time,
            last_paid_time: self.last_paid_time,
            last_paid_block: self.last_paid_block,
            last_watchdog_vote_time: self.last_watchdog_vote_time,
            last_ping_time: self.last_ping.sig_time,
            state: self.state,
            protocol_version: self.protocol_version,
            pose_ban_score: self.pose_ban_score,
        }
    }
}

impl fmt::Display for Subinode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subinode{{{} {} {} last_ping={} last_paid={}}}",
            self.addr,
            self.protocol_version,
            self.outpoint.short(),
            if self.last_ping.is_empty() {
                self.announce_time
            } else {
                self.last_ping.sig_time
            },
            self.last_paid_block,
        )
    }
}

/// Stable snapshot of a record for cross-component consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubinodeInfo {
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub collateral_pubkey: PubKey,
    pub service_pubkey: PubKey,
    pub announce_time: i64,
    pub last_dsq: i64,
    pub last_checked_time: i64,
    pub last_paid_time: i64,
    pub last_paid_block: BlockHeight,
    pub last_watchdog_vote_time: i64,
    pub last_ping_time: i64,
    pub state: SubinodeState,
    pub protocol_version: i32,
    pub pose_ban_score: i32,
}

impl SubinodeInfo {
    pub fn payee(&self) -> Script {
        Script::pay_to_key_id(&self.collateral_pubkey.key_id())
    }

    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -POSE_BAN_MAX_SCORE
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == SubinodeState::PoSeBanned
    }
}

/// Rank score of an outpoint against a block hash: the absolute distance
/// between `sha256d(block_hash)` and `sha256d(block_hash ‖ txid + vout)`,
/// both read little-endian.
pub fn score_for_outpoint(outpoint: &OutPoint, block_hash: &BlockHash) -> U256 {
    let aux = U256::from_little_endian(outpoint.txid.as_bytes())
        .overflowing_add(U256::from(outpoint.vout))
        .0;
    let mut aux_bytes = [0u8; 32];
    aux.to_little_endian(&mut aux_bytes);

    let hash2 = U256::from_little_endian(&sha256d(block_hash.as_bytes()));

    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(block_hash.as_bytes());
    seed.extend_from_slice(&aux_bytes);
    let hash3 = U256::from_little_endian(&sha256d(&seed));

    if hash3 > hash2 {
        hash3 - hash2
    } else {
        hash2 - hash3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PaymentsView;
    use subi_chain::test_util::{block_hash_for, MemoryChain};
    use subi_chain::Coin;
    use subi_types::{Transaction, TxOut, COIN};

    const NOW: i64 = 1_700_000_000;

    fn outpoint(tag: &[u8]) -> OutPoint {
        OutPoint::new(sha256d(tag).into(), 0)
    }

    fn chain_with_collateral(op: &OutPoint) -> MemoryChain {
        let chain = MemoryChain::with_tip(100);
        chain.add_utxo(
            *op,
            Coin {
                value: 10_000 * COIN,
                height: 50,
                script: Script::pay_to_key_id(&PubKey(vec![2u8; 33]).key_id()),
            },
        );
        chain
    }

    fn node(op: OutPoint) -> Subinode {
        let mut node = Subinode::new(
            "8.8.8.8:5335".parse().unwrap(),
            op,
            PubKey(vec![2u8; 33]),
            PubKey(vec![3u8; 33]),
            70021,
            NOW - 3600,
        );
        node.last_ping = Ping {
            outpoint: op,
            block_hash: block_hash_for(88),
            sig_time: NOW - 60,
            sig: MsgSignature(vec![1u8; 65]),
        };
        node
    }

    fn ctx<'a>(chain: &'a MemoryChain) -> CheckContext<'a> {
        CheckContext {
            now: NOW,
            tip_height: Some(100),
            chain,
            min_payments_proto: 70020,
            protocol_version: 70021,
            list_synced: true,
            watchdog_active: false,
            our_service_pubkey: None,
            node_count: 10,
        }
    }

    #[test]
    fn fresh_ping_enables_node() {
        let op = outpoint(b"a");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Enabled);
    }

    #[test]
    fn young_ping_stays_pre_enabled() {
        let op = outpoint(b"b");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        // Announced moments before the ping: still warming up.
        node.announce_time = NOW - 120;
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::PreEnabled);
    }

    #[test]
    fn stale_ping_expires_then_requires_restart() {
        let op = outpoint(b"c");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.last_ping.sig_time = NOW - EXPIRATION_SECONDS - 1;
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Expired);

        node.last_ping.sig_time = NOW - NEW_START_REQUIRED_SECONDS - 1;
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::NewStartRequired);
    }

    #[test]
    fn spent_collateral_is_terminal() {
        let op = outpoint(b"d");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        chain.spend_utxo(&op);
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::OutpointSpent);

        // Later checks never leave the state.
        let chain = chain_with_collateral(&op);
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::OutpointSpent);
    }

    #[test]
    fn ban_score_boundary() {
        let op = outpoint(b"e");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.pose_ban_score = POSE_BAN_MAX_SCORE - 1;
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Enabled);

        node.increase_pose_ban_score();
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::PoSeBanned);
        // Banned for a whole payment cycle.
        assert_eq!(node.pose_ban_until_height, 100 + 10);
    }

    #[test]
    fn banned_node_decays_past_unban_height() {
        let op = outpoint(b"f");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.state = SubinodeState::PoSeBanned;
        node.pose_ban_score = POSE_BAN_MAX_SCORE;
        node.pose_ban_until_height = 90;
        node.check(true, &ctx(&chain));
        assert_eq!(node.pose_ban_score, POSE_BAN_MAX_SCORE - 1);
        assert_eq!(node.state, SubinodeState::Enabled);
    }

    #[test]
    fn outdated_protocol_requires_update() {
        let op = outpoint(b"g");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.protocol_version = 70019;
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::UpdateRequired);
    }

    #[test]
    fn watchdog_expiry_outranks_ping_expiry() {
        let op = outpoint(b"h");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.last_watchdog_vote_time = NOW - WATCHDOG_MAX_SECONDS - 1;
        let mut context = ctx(&chain);
        context.watchdog_active = true;
        node.check(true, &context);
        assert_eq!(node.state, SubinodeState::WatchdogExpired);
    }

    #[test]
    fn check_is_throttled_without_force() {
        let op = outpoint(b"i");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Enabled);

        node.last_ping.sig_time = NOW - EXPIRATION_SECONDS - 1;
        node.check(false, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Enabled);
        node.check(true, &ctx(&chain));
        assert_eq!(node.state, SubinodeState::Expired);
    }

    #[test]
    fn score_is_deterministic_and_outpoint_sensitive() {
        let hash = block_hash_for(40);
        let a = score_for_outpoint(&outpoint(b"x"), &hash);
        let b = score_for_outpoint(&outpoint(b"x"), &hash);
        let c = score_for_outpoint(&outpoint(b"y"), &hash);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collateral_age_caches_height() {
        let op = outpoint(b"j");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        assert_eq!(node.collateral_age(&chain, 100), 50);
        // The cached height survives the UTXO disappearing.
        chain.spend_utxo(&op);
        assert_eq!(node.collateral_age(&chain, 110), 60);
    }

    struct OnePayee(Script);

    impl PaymentsView for OnePayee {
        fn min_payments_proto(&self) -> i32 {
            70020
        }
        fn is_scheduled(&self, _payee: &Script, _skip: BlockHeight) -> bool {
            false
        }
        fn has_payee_with_votes(
            &self,
            height: BlockHeight,
            payee: &Script,
            _min_votes: usize,
        ) -> bool {
            height == 98 && *payee == self.0
        }
        fn storage_limit(&self) -> i64 {
            5000
        }
    }

    #[test]
    fn last_paid_scan_finds_matching_block() {
        let op = outpoint(b"k");
        let chain = chain_with_collateral(&op);
        let mut node = node(op);
        let payee = node.payee();

        chain.set_block_time(98, NOW - 120);
        chain.set_coinbase(
            98,
            Transaction::new(vec![
                TxOut::new(70 * COIN, Script(vec![0x51])),
                TxOut::new(30 * COIN, payee.clone()),
            ]),
        );

        let schedule = subi_chain::test_util::FlatSchedule::default();
        node.update_last_paid(&chain, &schedule, &OnePayee(payee), 100, 100);
        assert_eq!(node.last_paid_block, 98);
        assert_eq!(node.last_paid_time, NOW - 120);
    }
}
