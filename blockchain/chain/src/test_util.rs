// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory collaborators for tests: a scriptable chain, a manual clock,
//! static sporks and a flat reward schedule.

use crate::{ChainView, Clock, Coin, PaymentSchedule, Spork, SporkOracle};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use subi_types::{sha256d, Amount, BlockHash, BlockHeight, OutPoint, Transaction, TxHash};

/// Deterministic fake block hash for a height.
pub fn block_hash_for(height: BlockHeight) -> BlockHash {
    sha256d(format!("block-{height}").as_bytes()).into()
}

#[derive(Default)]
struct MemoryChainInner {
    tip: Option<BlockHeight>,
    hash_heights: HashMap<BlockHash, BlockHeight>,
    block_times: HashMap<BlockHeight, i64>,
    utxos: HashMap<OutPoint, Coin>,
    tx_heights: HashMap<TxHash, BlockHeight>,
    coinbases: HashMap<BlockHeight, Transaction>,
}

/// Scriptable [`ChainView`] where every height up to the tip has the
/// deterministic hash from [`block_hash_for`].
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<MemoryChainInner>,
}

impl MemoryChain {
    pub fn with_tip(height: BlockHeight) -> Self {
        let chain = MemoryChain::default();
        chain.set_tip(height);
        chain
    }

    pub fn set_tip(&self, height: BlockHeight) {
        let mut inner = self.inner.write();
        let known = inner.tip.map(|t| t + 1).unwrap_or(0);
        for h in known.min(height)..=height {
            inner.hash_heights.insert(block_hash_for(h), h);
        }
        inner.tip = Some(height);
    }

    pub fn set_block_time(&self, height: BlockHeight, time: i64) {
        self.inner.write().block_times.insert(height, time);
    }

    pub fn add_utxo(&self, outpoint: OutPoint, coin: Coin) {
        let mut inner = self.inner.write();
        inner.tx_heights.insert(outpoint.txid, coin.height);
        inner.utxos.insert(outpoint, coin);
    }

    pub fn spend_utxo(&self, outpoint: &OutPoint) {
        self.inner.write().utxos.remove(outpoint);
    }

    pub fn set_coinbase(&self, height: BlockHeight, tx: Transaction) {
        self.inner.write().coinbases.insert(height, tx);
    }
}

impl ChainView for MemoryChain {
    fn tip_height(&self) -> Option<BlockHeight> {
        self.inner.read().tip
    }

    fn block_hash(&self, height: BlockHeight) -> Option<BlockHash> {
        let tip = self.inner.read().tip?;
        if height >= 0 && height <= tip {
            Some(block_hash_for(height))
        } else {
            None
        }
    }

    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight> {
        let inner = self.inner.read();
        let height = inner.hash_heights.get(hash).copied()?;
        if height <= inner.tip? {
            Some(height)
        } else {
            None
        }
    }

    fn block_time(&self, height: BlockHeight) -> Option<i64> {
        self.inner.read().block_times.get(&height).copied()
    }

    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.inner.read().utxos.get(outpoint).cloned()
    }

    fn tx_height(&self, txid: &TxHash) -> Option<BlockHeight> {
        self.inner.read().tx_heights.get(txid).copied()
    }

    fn coinbase(&self, height: BlockHeight) -> Option<Transaction> {
        self.inner.read().coinbases.get(&height).cloned()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: RwLock<i64>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        ManualClock {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        *self.now.write() = now;
    }

    pub fn advance(&self, seconds: i64) {
        *self.now.write() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        *self.now.read()
    }
}

/// Spork oracle with a fixed active set.
#[derive(Default)]
pub struct StaticSporks {
    active: HashSet<Spork>,
}

impl StaticSporks {
    pub fn with_active(sporks: &[Spork]) -> Self {
        StaticSporks {
            active: sporks.iter().copied().collect(),
        }
    }
}

impl SporkOracle for StaticSporks {
    fn is_active(&self, spork: Spork) -> bool {
        self.active.contains(&spork)
    }
}

/// Reward schedule paying a fixed fraction of the block value.
pub struct FlatSchedule {
    pub numerator: Amount,
    pub denominator: Amount,
}

impl Default for FlatSchedule {
    fn default() -> Self {
        // Three tenths of the block value goes to the elected subinode.
        FlatSchedule {
            numerator: 3,
            denominator: 10,
        }
    }
}

impl PaymentSchedule for FlatSchedule {
    fn subinode_payment(&self, _height: BlockHeight, block_value: Amount) -> Amount {
        block_value * self.numerator / self.denominator
    }
}
