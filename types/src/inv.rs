// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inventory item kinds announced or requested by the tier subsystem.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum InvKind {
    SubinodeAnnounce,
    SubinodePing,
    SubinodeVerify,
    PaymentVote,
    PaymentBlock,
}

/// Inventory reference relayed to or fetched from peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn new(kind: InvKind, hash: Hash256) -> Self {
        Inv { kind, hash }
    }
}

impl fmt::Debug for Inv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inv({:?}, {})", self.kind, self.hash)
    }
}

/// Hard cap on inventory items per message, matching the relay layer's
/// GETDATA limit.
pub const MAX_INV_SIZE: usize = 50_000;
