// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use subi_types::OutPoint;

/// Forward and reverse index between collateral outpoints and integers.
///
/// Normally add-only and expected to be permanent; it is only rebuilt when
/// removals leave it larger than both the expected maximum and the live
/// node count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubinodeIndex {
    size: i32,
    forward: HashMap<OutPoint, i32>,
    #[serde(skip)]
    reverse: HashMap<i32, OutPoint>,
}

impl SubinodeIndex {
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Outpoint for an index value.
    pub fn get(&self, index: i32) -> Option<OutPoint> {
        self.reverse.get(&index).copied()
    }

    /// Index of an outpoint, -1 when unknown.
    pub fn index_of(&self, outpoint: &OutPoint) -> i32 {
        self.forward.get(outpoint).copied().unwrap_or(-1)
    }

    pub fn insert(&mut self, outpoint: OutPoint) {
        if self.forward.contains_key(&outpoint) {
            return;
        }
        let next = self.size;
        self.forward.insert(outpoint, next);
        self.reverse.insert(next, outpoint);
        self.size += 1;
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.size = 0;
    }

    /// Restore the reverse map after deserialization.
    pub fn rebuild_reverse(&mut self) {
        self.size = self.forward.len() as i32;
        self.reverse = self
            .forward
            .iter()
            .map(|(outpoint, index)| (*index, *outpoint))
            .collect();
    }
}
