// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{ChainParams, Network};

pub const PARAMS: ChainParams = ChainParams {
    network: Network::Mainnet,
    default_port: 5335,
    min_collateral_confirmations: 15,
    payments_start_block: 1000,
    tier_initialize_height: 999,
    max_tip_age: 30 * 60 * 60,
    fee_distribution_start_block: 75_000,
    sync_enough_peers: 1,
    secret_version: 0xd4,
};
