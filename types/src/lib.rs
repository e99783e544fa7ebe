// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

mod address;
mod hash;
mod inv;
mod keys;
mod outpoint;
mod script;
mod transaction;

pub use self::address::*;
pub use self::hash::*;
pub use self::inv::*;
pub use self::keys::*;
pub use self::outpoint::*;
pub use self::script::*;
pub use self::transaction::*;

/// Monetary amount in the smallest unit.
pub type Amount = i64;

/// Number of base units in one coin.
pub const COIN: Amount = 100_000_000;

/// Block height. Negative values are used as sentinels by callers.
pub type BlockHeight = i64;
