// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-block payment election: subinodes vote on who gets the next block's
//! service payment, blocks are validated against the winning payee, and the
//! vote history is synced to bootstrapping peers.

mod payments;
#[cfg(test)]
mod payments_test;
mod vote;

pub use self::payments::*;
pub use self::vote::*;

/// Votes a payee needs before a height counts as decided.
pub const MNPAYMENTS_SIGNATURES_REQUIRED: usize = 6;
/// Rank window of nodes allowed to vote for a height.
pub const MNPAYMENTS_SIGNATURES_TOTAL: i64 = 10;

/// Minimum protocol versions eligible for payment messages. V1 was the last
/// floor before the fee-distribution update, V2 is the current one.
pub const MIN_PAYMENT_PROTO_VERSION_1: i32 = 70020;
pub const MIN_PAYMENT_PROTO_VERSION_2: i32 = 70021;

/// Votes are accepted this many blocks past the tip.
pub const FUTURE_VOTE_BLOCKS: i64 = 20;
/// A payee elected within this lookahead is considered scheduled.
pub const SCHEDULED_BLOCKS_AHEAD: i64 = 8;
