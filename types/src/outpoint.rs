// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::TxHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference to a transaction output, the identity of a subinode collateral.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OutPoint {
    pub txid: TxHash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: TxHash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// An all-zero outpoint, used as the "no filter" directory request.
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == 0
    }

    /// Short rendering used inside signed message layouts: `<txid>-<vout>`.
    pub fn short(&self) -> String {
        format!("{}-{}", self.txid.hex(), self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutPoint({}-{})", self.txid, self.vout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutPointParseError {
    #[error("outpoint must be of the form <txid>:<vout>")]
    MissingSeparator,
    #[error("invalid txid: {0}")]
    InvalidTxid(#[from] hex::FromHexError),
    #[error("invalid output index: {0}")]
    InvalidVout(#[from] std::num::ParseIntError),
}

impl FromStr for OutPoint {
    type Err = OutPointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or(OutPointParseError::MissingSeparator)?;
        Ok(OutPoint {
            txid: txid.parse()?,
            vout: vout.parse()?,
        })
    }
}
