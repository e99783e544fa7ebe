// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use subi_types::BlockHeight;

/// Stages of the tier bootstrap, in the order they are driven.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncStage {
    /// Sync gave up and waits for a reset.
    Failed,
    /// Nothing requested yet.
    Initial,
    /// Requesting sporks from every peer.
    Sporks,
    /// Downloading the subinode directory.
    List,
    /// Downloading payment votes.
    Winners,
    /// Bootstrap complete, following the network live.
    Finished,
}

impl SyncStage {
    pub fn as_i32(self) -> i32 {
        match self {
            SyncStage::Failed => -1,
            SyncStage::Initial => 0,
            SyncStage::Sporks => 1,
            SyncStage::List => 2,
            SyncStage::Winners => 3,
            SyncStage::Finished => 999,
        }
    }

    pub fn from_i32(value: i32) -> SyncStage {
        match value {
            -1 => SyncStage::Failed,
            0 => SyncStage::Initial,
            1 => SyncStage::Sporks,
            2 => SyncStage::List,
            3 => SyncStage::Winners,
            _ => SyncStage::Finished,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStage::Failed => "SUBINODE_SYNC_FAILED",
            SyncStage::Initial => "SUBINODE_SYNC_INITIAL",
            SyncStage::Sporks => "SUBINODE_SYNC_SPORKS",
            SyncStage::List => "SUBINODE_SYNC_LIST",
            SyncStage::Winners => "SUBINODE_SYNC_MNW",
            SyncStage::Finished => "SUBINODE_SYNC_FINISHED",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of the bootstrap progress. The sync driver owns all
/// transitions; the manager and the payment voter only read.
pub struct SyncStatus {
    stage: AtomicI32,
    blockchain_synced: AtomicBool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            stage: AtomicI32::new(SyncStage::Initial.as_i32()),
            blockchain_synced: AtomicBool::new(false),
        }
    }
}

impl SyncStatus {
    pub fn stage(&self) -> SyncStage {
        SyncStage::from_i32(self.stage.load(Ordering::SeqCst))
    }

    pub fn set_stage(&self, stage: SyncStage) {
        self.stage.store(stage.as_i32(), Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.stage() == SyncStage::Failed
    }

    /// Header/block chain considered caught up; cached by the driver.
    pub fn is_blockchain_synced(&self) -> bool {
        self.blockchain_synced.load(Ordering::SeqCst)
    }

    pub fn set_blockchain_synced(&self, synced: bool) {
        self.blockchain_synced.store(synced, Ordering::SeqCst);
    }

    /// The directory stage has completed.
    pub fn is_list_synced(&self) -> bool {
        self.stage.load(Ordering::SeqCst) > SyncStage::List.as_i32()
    }

    /// The payment-vote stage has completed.
    pub fn is_winners_synced(&self) -> bool {
        self.stage.load(Ordering::SeqCst) > SyncStage::Winners.as_i32()
    }

    /// Fully bootstrapped. Trivially true while the chain is still within
    /// its first few blocks.
    pub fn is_synced(&self, height: BlockHeight) -> bool {
        if height < 6 {
            return true;
        }
        self.stage() == SyncStage::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_thresholds() {
        let status = SyncStatus::default();
        assert!(!status.is_list_synced());
        status.set_stage(SyncStage::Winners);
        assert!(status.is_list_synced());
        assert!(!status.is_winners_synced());
        status.set_stage(SyncStage::Finished);
        assert!(status.is_winners_synced());
        assert!(status.is_synced(100));
    }

    #[test]
    fn low_heights_count_as_synced() {
        let status = SyncStatus::default();
        assert!(status.is_synced(5));
        assert!(!status.is_synced(6));
    }

    #[test]
    fn stage_round_trip() {
        for stage in [
            SyncStage::Failed,
            SyncStage::Initial,
            SyncStage::Sporks,
            SyncStage::List,
            SyncStage::Winners,
            SyncStage::Finished,
        ] {
            assert_eq!(SyncStage::from_i32(stage.as_i32()), stage);
        }
    }
}
