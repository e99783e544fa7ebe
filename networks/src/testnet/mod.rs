// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{ChainParams, Network};

pub const PARAMS: ChainParams = ChainParams {
    network: Network::Testnet,
    default_port: 15335,
    min_collateral_confirmations: 15,
    payments_start_block: 50,
    tier_initialize_height: 20,
    max_tip_age: i64::MAX,
    fee_distribution_start_block: 1000,
    sync_enough_peers: 1,
    secret_version: 0xef,
};
