// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subi_types::{Amount, BlockHeight, COIN};

pub mod mainnet;
pub mod regtest;
pub mod testnet;

/// Newest protocol version spoken by this build.
pub const PROTOCOL_VERSION: i32 = 70021;

/// Collateral locked behind every subinode.
pub const SUBINODE_COLLATERAL: Amount = 10_000 * COIN;

/// Which chain this process follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn params(self) -> &'static ChainParams {
        match self {
            Network::Mainnet => &mainnet::PARAMS,
            Network::Testnet => &testnet::PARAMS,
            Network::Regtest => &regtest::PARAMS,
        }
    }

    pub fn is_mainnet(self) -> bool {
        self == Network::Mainnet
    }

    pub fn is_regtest(self) -> bool {
        self == Network::Regtest
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Consensus-adjacent parameters the tier subsystem consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub network: Network,
    /// P2P listen port; announcements must use it on mainnet and must not
    /// use the mainnet port elsewhere.
    pub default_port: u16,
    /// Depth a collateral UTXO needs before an announce is accepted.
    pub min_collateral_confirmations: i64,
    /// Height at which subinode payment enforcement may begin.
    pub payments_start_block: BlockHeight,
    /// Below this height the tier treats the blockchain as trivially synced.
    pub tier_initialize_height: BlockHeight,
    /// Wall-clock age after which the tip no longer counts as synced.
    pub max_tip_age: i64,
    /// Height from which the newer payment protocol floor is unconditional.
    pub fee_distribution_start_block: BlockHeight,
    /// Peers that must agree with our height before the tier starts syncing.
    pub sync_enough_peers: usize,
    /// Base58 version byte for service-node secrets.
    pub secret_version: u8,
}

/// The mainnet P2P port, referenced by the port policy on every network.
pub fn mainnet_default_port() -> u16 {
    mainnet::PARAMS.default_port
}
