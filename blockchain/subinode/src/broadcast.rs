// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{
    Rejected, Subinode, SubinodeState, MIN_PING_SECONDS, NEW_START_REQUIRED_SECONDS,
    PING_BLOCK_DEPTH, PING_MAX_LAG_BLOCKS,
};
use serde::{Deserialize, Serialize};
use subi_chain::{ChainView, Clock};
use subi_crypto::SecretKey;
use subi_networks::{mainnet_default_port, ChainParams, PROTOCOL_VERSION};
use subi_types::{hash_of, BlockHash, Hash256, MsgSignature, NetAddress, OutPoint, PubKey, Script};

/// Allowed clock skew on signature times, one hour into the future.
const SIG_TIME_FUTURE_SLACK: i64 = 60 * 60;

/// Signed liveness beacon referencing a recent block hash.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping {
    pub outpoint: OutPoint,
    pub block_hash: BlockHash,
    pub sig_time: i64,
    pub sig: MsgSignature,
}

impl Ping {
    /// Build an unsigned ping for our own node. Requires the chain to have
    /// at least [`PING_BLOCK_DEPTH`] blocks.
    pub fn create(outpoint: OutPoint, chain: &dyn ChainView, clock: &dyn Clock) -> Option<Ping> {
        let tip = chain.tip_height()?;
        if tip < PING_BLOCK_DEPTH {
            return None;
        }
        Some(Ping {
            outpoint,
            block_hash: chain.block_hash(tip - PING_BLOCK_DEPTH)?,
            sig_time: clock.now(),
            sig: MsgSignature::default(),
        })
    }

    /// An empty ping, the "no ping yet" marker inside announces.
    pub fn is_empty(&self) -> bool {
        *self == Ping::default()
    }

    pub fn hash(&self) -> Hash256 {
        hash_of(&(&self.outpoint, self.sig_time))
    }

    /// Byte-exact layout covered by the ping signature.
    pub fn signed_message(&self) -> String {
        format!("{}{}{}", self.outpoint, self.block_hash.hex(), self.sig_time)
    }

    pub fn sign(&mut self, key: &SecretKey, service_pubkey: &PubKey, now: i64) -> bool {
        self.sig_time = now;
        let message = self.signed_message();
        match subi_crypto::sign_message(key, &message) {
            Ok(sig) => {
                self.sig = sig;
                subi_crypto::verify_message(service_pubkey, &self.sig, &message).is_ok()
            }
            Err(_) => false,
        }
    }

    pub fn verify_signature(&self, service_pubkey: &PubKey) -> Result<(), Rejected> {
        subi_crypto::verify_message(service_pubkey, &self.sig, &self.signed_message())
            .map_err(|e| Rejected::new(33, format!("bad subinode ping signature: {e}")))
    }

    /// Structural checks that need no record: sane timestamp, known block.
    pub fn simple_check(&self, chain: &dyn ChainView, now: i64) -> Result<(), Rejected> {
        if self.sig_time > now + SIG_TIME_FUTURE_SLACK {
            return Err(Rejected::new(1, "ping signature too far into the future"));
        }
        if chain.height_of(&self.block_hash).is_none() {
            // We may be stuck or forked; do not penalize the sender.
            return Err(Rejected::soft("ping references an unknown block hash"));
        }
        Ok(())
    }

    /// Pings older than the new-start window carry no information.
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.sig_time > NEW_START_REQUIRED_SECONDS
    }
}

/// Result of installing a ping into a record.
#[derive(Debug, PartialEq, Eq)]
pub struct PingUpdate {
    /// List sync was starving for this record; credit progress.
    pub bump_sync: bool,
}

impl Ping {
    /// Validate this ping against its record and install it. The caller
    /// resolves the record and owns relay plus seen-map bookkeeping.
    pub fn check_and_update(
        &self,
        node: Option<&mut Subinode>,
        from_new_announce: bool,
        chain: &dyn ChainView,
        now: i64,
        list_synced: bool,
    ) -> Result<PingUpdate, Rejected> {
        self.simple_check(chain, now)?;

        let node = node.ok_or_else(|| Rejected::soft("no subinode entry for ping"))?;

        if !from_new_announce {
            if node.is_update_required() {
                return Err(Rejected::soft("subinode protocol is outdated"));
            }
            if node.is_new_start_required() {
                return Err(Rejected::soft("subinode is completely expired"));
            }
        }

        if let (Some(height), Some(tip)) = (chain.height_of(&self.block_hash), chain.tip_height())
        {
            if height < tip - PING_MAX_LAG_BLOCKS {
                return Err(Rejected::soft("ping block hash is too old"));
            }
        }

        // Update only when the previous ping is at least a ping interval
        // (minus slack) older than this one.
        if node.is_pinged_within(MIN_PING_SECONDS - 60, self.sig_time) {
            return Err(Rejected::soft("ping arrived too early"));
        }

        self.verify_signature(&node.service_pubkey)?;

        // While still syncing, a node silent for half the expiry window
        // counts as list-sync progress when it finally speaks.
        let bump_sync = !list_synced && !node.is_pinged_within(crate::EXPIRATION_SECONDS / 2, now);

        node.last_ping = self.clone();
        Ok(PingUpdate { bump_sync })
    }
}

/// Signed record claiming service-node identity, address and protocol
/// version; superseded by announce time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announce {
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub collateral_pubkey: PubKey,
    pub service_pubkey: PubKey,
    pub sig: MsgSignature,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub last_ping: Ping,
    /// Recovery replays may supersede equal-time announces. Local flag,
    /// never serialized.
    #[serde(skip)]
    pub recovery: bool,
}

impl Announce {
    pub fn from_node(node: &Subinode) -> Announce {
        Announce {
            outpoint: node.outpoint,
            addr: node.addr,
            collateral_pubkey: node.collateral_pubkey.clone(),
            service_pubkey: node.service_pubkey.clone(),
            sig: node.announce_sig.clone(),
            sig_time: node.announce_time,
            protocol_version: node.protocol_version,
            last_ping: node.last_ping.clone(),
            recovery: false,
        }
    }

    /// Materialize the record this announce describes.
    pub fn to_node(&self) -> Subinode {
        let mut node = Subinode::new(
            self.addr,
            self.outpoint,
            self.collateral_pubkey.clone(),
            self.service_pubkey.clone(),
            self.protocol_version,
            self.sig_time,
        );
        node.announce_sig = self.sig.clone();
        node.last_ping = self.last_ping.clone();
        node.last_watchdog_vote_time = self.sig_time;
        node
    }

    pub fn hash(&self) -> Hash256 {
        hash_of(&(&self.outpoint, &self.collateral_pubkey, self.sig_time))
    }

    /// Byte-exact layout covered by the announce signature.
    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            self.collateral_pubkey.key_id().hex(),
            self.service_pubkey.key_id().hex(),
            self.protocol_version
        )
    }

    pub fn sign(&mut self, collateral_key: &SecretKey, now: i64) -> bool {
        self.sig_time = now;
        let message = self.signed_message();
        match subi_crypto::sign_message(collateral_key, &message) {
            Ok(sig) => {
                self.sig = sig;
                subi_crypto::verify_message(&self.collateral_pubkey, &self.sig, &message).is_ok()
            }
            Err(_) => false,
        }
    }

    pub fn verify_signature(&self) -> Result<(), Rejected> {
        subi_crypto::verify_message(&self.collateral_pubkey, &self.sig, &self.signed_message())
            .map_err(|e| Rejected::new(100, format!("bad subinode announce signature: {e}")))
    }

    /// Announce endpoints must be routable IPv4 (any address on regtest).
    pub fn has_valid_addr(&self, params: &ChainParams) -> bool {
        params.network.is_regtest() || (self.addr.is_ipv4() && self.addr.is_routable())
    }

    /// Structural checks. On success returns the state the record should be
    /// created in: `Expired` when the embedded ping is missing or broken,
    /// `PreEnabled` otherwise.
    pub fn simple_check(
        &self,
        params: &ChainParams,
        min_payments_proto: i32,
        chain: &dyn ChainView,
        now: i64,
    ) -> Result<SubinodeState, Rejected> {
        if !self.has_valid_addr(params) {
            return Err(Rejected::soft("invalid announce address"));
        }

        if self.sig_time > now + SIG_TIME_FUTURE_SLACK {
            return Err(Rejected::new(1, "announce signature too far into the future"));
        }

        let install_state =
            if self.last_ping.is_empty() || self.last_ping.simple_check(chain, now).is_err() {
                // One of us is probably forked; keep the record but expired.
                SubinodeState::Expired
            } else {
                SubinodeState::PreEnabled
            };

        if self.protocol_version < min_payments_proto {
            return Err(Rejected::soft("outdated subinode announce"));
        }

        if self.collateral_pubkey.is_empty() || self.service_pubkey.is_empty() {
            return Err(Rejected::new(100, "announce with empty key material"));
        }

        let mainnet_port = mainnet_default_port();
        if params.network.is_mainnet() {
            if self.addr.port() != mainnet_port {
                return Err(Rejected::soft("wrong port for mainnet announce"));
            }
        } else if self.addr.port() == mainnet_port {
            return Err(Rejected::soft("mainnet port outside mainnet"));
        }

        Ok(install_state)
    }

    /// Validate the collateral behind the announce: the UTXO exists, holds
    /// exactly the collateral amount, is deep enough, predates the announce
    /// signature and was produced for the collateral key.
    ///
    /// A `retry` rejection means the chain may simply not have caught up;
    /// the caller forgets the announce so it can be processed again later.
    pub fn check_outpoint(
        &self,
        params: &ChainParams,
        chain: &dyn ChainView,
        collateral: subi_types::Amount,
    ) -> Result<(), OutpointCheck> {
        self.verify_signature().map_err(OutpointCheck::Rejected)?;

        let coin = chain
            .utxo(&self.outpoint)
            .ok_or(OutpointCheck::Retry("collateral UTXO not found"))?;

        if coin.value != collateral {
            return Err(OutpointCheck::Rejected(Rejected::soft(
                "collateral UTXO has the wrong amount",
            )));
        }

        let tip = chain
            .tip_height()
            .ok_or(OutpointCheck::Retry("chain has no tip"))?;
        if tip - coin.height + 1 < params.min_collateral_confirmations {
            // We may be missing a few blocks; check this announce again.
            return Err(OutpointCheck::Retry("collateral not deep enough"));
        }

        // The announce must not predate the block that buried the
        // collateral under the required confirmations.
        let conf_height = coin.height + params.min_collateral_confirmations - 1;
        if let Some(conf_time) = chain.block_time(conf_height) {
            if conf_time > self.sig_time {
                return Err(OutpointCheck::Rejected(Rejected::soft(
                    "announce signed before collateral matured",
                )));
            }
        }

        if coin.script != Script::pay_to_key_id(&self.collateral_pubkey.key_id()) {
            return Err(OutpointCheck::Rejected(Rejected::new(
                33,
                "collateral not owned by announce key",
            )));
        }

        Ok(())
    }

    /// Adopt this announce's fields on an existing record. Rejects anything
    /// not strictly newer unless it is a recovery replay. Resets the
    /// proof-of-service score and installs the embedded ping when it
    /// validates against the updated record.
    pub fn apply_to(
        &self,
        node: &mut Subinode,
        chain: &dyn ChainView,
        now: i64,
        list_synced: bool,
    ) -> bool {
        if self.sig_time <= node.announce_time && !self.recovery {
            return false;
        }
        node.service_pubkey = self.service_pubkey.clone();
        node.announce_time = self.sig_time;
        node.announce_sig = self.sig.clone();
        node.protocol_version = self.protocol_version;
        node.addr = self.addr;
        node.pose_ban_score = 0;
        node.pose_ban_until_height = 0;
        node.last_checked_time = 0;
        if !self.last_ping.is_empty() {
            let _ = self
                .last_ping
                .check_and_update(Some(node), true, chain, now, list_synced);
        }
        true
    }

    /// Build and sign an announce (plus embedded ping) for our own node.
    pub fn create(
        outpoint: OutPoint,
        addr: NetAddress,
        collateral_key: &SecretKey,
        collateral_pubkey: PubKey,
        service_key: &SecretKey,
        service_pubkey: PubKey,
        params: &ChainParams,
        chain: &dyn ChainView,
        clock: &dyn Clock,
    ) -> Result<Announce, String> {
        let mut ping = Ping::create(outpoint, chain, clock)
            .ok_or_else(|| format!("not enough blocks to ping, subinode={}", outpoint.short()))?;
        if !ping.sign(service_key, &service_pubkey, clock.now()) {
            return Err(format!("failed to sign ping, subinode={}", outpoint.short()));
        }

        let mut announce = Announce {
            outpoint,
            addr,
            collateral_pubkey,
            service_pubkey,
            sig: MsgSignature::default(),
            sig_time: clock.now(),
            protocol_version: PROTOCOL_VERSION,
            last_ping: ping,
            recovery: false,
        };

        if !announce.has_valid_addr(params) {
            return Err(format!("invalid address, subinode={}", outpoint.short()));
        }
        if !announce.sign(collateral_key, clock.now()) {
            return Err(format!(
                "failed to sign announce, subinode={}",
                outpoint.short()
            ));
        }
        Ok(announce)
    }
}

/// Outcome of [`Announce::check_outpoint`].
#[derive(Debug)]
pub enum OutpointCheck {
    /// Drop and penalize per the contained rejection.
    Rejected(Rejected),
    /// Drop without penalty and forget the announce so it can be retried.
    Retry(&'static str),
}
