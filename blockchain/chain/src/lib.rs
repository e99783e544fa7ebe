// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Narrow interfaces through which the subinode tier observes the rest of
//! the node: chain tip, block hashes, the UTXO view, wall clock, sporks,
//! the reward schedule and the wallet. The tier never reaches past these.

mod events;
mod sync_status;
pub mod test_util;

pub use self::events::*;
pub use self::sync_status::*;

use subi_crypto::SecretKey;
use subi_types::{Amount, BlockHash, BlockHeight, OutPoint, PubKey, Script, Transaction, TxHash};

/// An unspent output as the tier sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub value: Amount,
    pub height: BlockHeight,
    pub script: Script,
}

/// Read-only view of the active chain and UTXO set.
pub trait ChainView: Send + Sync {
    /// Height of the current tip, `None` before the first block connects.
    fn tip_height(&self) -> Option<BlockHeight>;

    /// Hash of the block at `height` on the active chain.
    fn block_hash(&self, height: BlockHeight) -> Option<BlockHash>;

    /// Height of a known block hash on the active chain.
    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight>;

    /// Wall-clock time of the block at `height`.
    fn block_time(&self, height: BlockHeight) -> Option<i64>;

    /// Unspent output lookup; `None` once spent or unknown.
    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Height at which a transaction was mined.
    fn tx_height(&self, txid: &TxHash) -> Option<BlockHeight>;

    /// Coinbase (or coinstake) outputs of the block at `height`, for the
    /// last-paid scan.
    fn coinbase(&self, height: BlockHeight) -> Option<Transaction>;
}

/// Network-adjusted time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// System wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

/// Network-wide feature flags consulted by the tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Spork {
    /// Enforce that blocks pay the elected subinode.
    PaymentEnforcement,
    /// Require the newer payment protocol version from voters and payees.
    PayUpdatedNodes,
    /// Superblock payouts allowed (consulted by block-value validation).
    SuperblocksEnabled,
}

pub trait SporkOracle: Send + Sync {
    fn is_active(&self, spork: Spork) -> bool;
}

/// The block reward split. The full reward curve lives outside the tier;
/// only the subinode share is consumed here.
pub trait PaymentSchedule: Send + Sync {
    fn subinode_payment(&self, height: BlockHeight, block_value: Amount) -> Amount;
}

/// A wallet-held collateral candidate with its signing material.
pub struct Collateral {
    pub outpoint: OutPoint,
    pub pubkey: PubKey,
    pub secret: SecretKey,
}

/// The minimal wallet surface the active-self controller needs.
pub trait WalletView: Send + Sync {
    fn is_locked(&self) -> bool;

    fn balance(&self) -> Amount;

    /// Find a collateral-sized output, optionally pinned to a specific
    /// outpoint from configuration.
    fn find_collateral(&self, filter: Option<OutPoint>) -> Option<Collateral>;

    /// Keep the collateral from being spent by regular transactions.
    fn lock_coin(&self, outpoint: &OutPoint);
}
