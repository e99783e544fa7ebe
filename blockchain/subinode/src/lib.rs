// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! The subinode set: per-node records with their liveness state machine,
//! announce/ping wire records, and the manager that owns the authoritative
//! list, ranks nodes, runs proof-of-service cross-verification and drives
//! recovery of stale entries.

mod broadcast;
mod identity;
mod index;
mod manager;
mod record;
pub mod store;
mod verify;

pub use self::broadcast::*;
pub use self::identity::*;
pub use self::index::*;
pub use self::manager::*;
pub use self::record::*;
pub use self::verify::*;

use subi_types::{BlockHeight, Script};

/// Throttle between unforced record checks.
pub const CHECK_SECONDS: i64 = 5;
/// Minimum age before an announce may be superseded by a routine re-announce.
pub const MIN_ANNOUNCE_SECONDS: i64 = 5 * 60;
/// Minimum interval between pings; also the pre-enabled grace period.
pub const MIN_PING_SECONDS: i64 = 10 * 60;
/// No ping for this long expires a node.
pub const EXPIRATION_SECONDS: i64 = 65 * 60;
/// No watchdog vote for this long expires the watchdog.
pub const WATCHDOG_MAX_SECONDS: i64 = 120 * 60;
/// No ping for this long requires a fresh announce.
pub const NEW_START_REQUIRED_SECONDS: i64 = 180 * 60;
/// Proof-of-service score that triggers a ban.
pub const POSE_BAN_MAX_SCORE: i32 = 5;

/// Pings reference the block this many blocks below the tip.
pub const PING_BLOCK_DEPTH: i64 = 12;
/// Pings referencing blocks further behind the tip are stale.
pub const PING_MAX_LAG_BLOCKS: i64 = 24;

/// Directory request windows per peer.
pub const DSEG_UPDATE_SECONDS: i64 = 3 * 60 * 60;
/// Routine last-paid scan depth once warmed up.
pub const LAST_PAID_SCAN_BLOCKS: i64 = 100;

/// Proof-of-service fan-out, eligibility rank and history depth.
pub const MAX_POSE_CONNECTIONS: usize = 10;
pub const MAX_POSE_RANK: i64 = 10;
pub const MAX_POSE_BLOCKS: i64 = 10;

/// Recovery quorum parameters for nodes stuck in `NewStartRequired`.
pub const MNB_RECOVERY_QUORUM_TOTAL: usize = 10;
pub const MNB_RECOVERY_QUORUM_REQUIRED: usize = 6;
pub const MNB_RECOVERY_MAX_ASK_ENTRIES: usize = 10;
pub const MNB_RECOVERY_WAIT_SECONDS: i64 = 60;
pub const MNB_RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;

/// Compact index rebuild policy.
pub const MAX_EXPECTED_INDEX_SIZE: usize = 30_000;
pub const MIN_INDEX_REBUILD_TIME: i64 = 3600;

/// A protocol-level rejection: the message is dropped and the sender may be
/// penalized by `dos` misbehavior points (0 means drop silently).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Rejected {
    pub dos: u32,
    pub reason: String,
}

impl Rejected {
    pub fn new(dos: u32, reason: impl Into<String>) -> Self {
        Rejected {
            dos,
            reason: reason.into(),
        }
    }

    pub fn soft(reason: impl Into<String>) -> Self {
        Rejected::new(0, reason)
    }
}

/// What the payment voter exposes back to the manager. Implemented by the
/// payments store; passed explicitly so the two singletons never hold each
/// other.
pub trait PaymentsView: Send + Sync {
    /// Minimum protocol version eligible for payment at the current tip.
    fn min_payments_proto(&self) -> i32;

    /// Whether `payee` is already elected in the payment lookahead window,
    /// ignoring `skip_height`.
    fn is_scheduled(&self, payee: &Script, skip_height: BlockHeight) -> bool;

    /// Whether the block-payees record at `height` credits `payee` with at
    /// least `min_votes` votes.
    fn has_payee_with_votes(&self, height: BlockHeight, payee: &Script, min_votes: usize)
        -> bool;

    /// Heights of vote history kept around.
    fn storage_limit(&self) -> i64;
}
