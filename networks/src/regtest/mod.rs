// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{ChainParams, Network};

pub const PARAMS: ChainParams = ChainParams {
    network: Network::Regtest,
    default_port: 25335,
    min_collateral_confirmations: 1,
    payments_start_block: 720,
    tier_initialize_height: 600,
    max_tip_age: 30 * 60 * 60,
    fee_distribution_start_block: 1000,
    sync_enough_peers: 1,
    secret_version: 0xef,
};
