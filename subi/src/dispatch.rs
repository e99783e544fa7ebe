// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::de::DeserializeOwned;
use subi_net::opcode;
use subi_payments::PaymentVote;
use subi_subinode::{Announce, Ping, Verify};
use subi_types::OutPoint;
use thiserror::Error;

/// One inbound tier message, decoded from its wire opcode. The opcode set
/// is closed; handlers match exhaustively.
#[derive(Debug, Clone)]
pub enum TierMessage {
    Announce(Box<Announce>),
    Ping(Ping),
    Directory(OutPoint),
    Verify(Verify),
    PaymentSync(i32),
    PaymentVote(PaymentVote),
    SyncStatusCount(i32, i32),
    GetSporks,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a tier opcode; the caller routes it elsewhere.
    #[error("not a tier opcode: {0}")]
    UnknownOpcode(String),
    /// Structurally corrupt payload; worth a ban.
    #[error("malformed {opcode} payload: {reason}")]
    Malformed { opcode: &'static str, reason: String },
}

fn payload<T: DeserializeOwned>(op: &'static str, bytes: &[u8]) -> Result<T, DecodeError> {
    bincode::deserialize(bytes).map_err(|e| DecodeError::Malformed {
        opcode: op,
        reason: e.to_string(),
    })
}

impl TierMessage {
    pub fn decode(op: &str, bytes: &[u8]) -> Result<TierMessage, DecodeError> {
        match op {
            opcode::MNANNOUNCE => Ok(TierMessage::Announce(Box::new(payload(
                opcode::MNANNOUNCE,
                bytes,
            )?))),
            opcode::MNPING => Ok(TierMessage::Ping(payload(opcode::MNPING, bytes)?)),
            opcode::DSEG => Ok(TierMessage::Directory(payload(opcode::DSEG, bytes)?)),
            opcode::MNVERIFY => Ok(TierMessage::Verify(payload(opcode::MNVERIFY, bytes)?)),
            opcode::MNGET => Ok(TierMessage::PaymentSync(payload(opcode::MNGET, bytes)?)),
            opcode::MNWINNER => Ok(TierMessage::PaymentVote(payload(opcode::MNWINNER, bytes)?)),
            opcode::SYNCSTATUSCOUNT => {
                let (item_id, count) = payload(opcode::SYNCSTATUSCOUNT, bytes)?;
                Ok(TierMessage::SyncStatusCount(item_id, count))
            }
            opcode::GETSPORKS => Ok(TierMessage::GetSporks),
            other => Err(DecodeError::UnknownOpcode(other.to_owned())),
        }
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            TierMessage::Announce(_) => opcode::MNANNOUNCE,
            TierMessage::Ping(_) => opcode::MNPING,
            TierMessage::Directory(_) => opcode::DSEG,
            TierMessage::Verify(_) => opcode::MNVERIFY,
            TierMessage::PaymentSync(_) => opcode::MNGET,
            TierMessage::PaymentVote(_) => opcode::MNWINNER,
            TierMessage::SyncStatusCount(..) => opcode::SYNCSTATUSCOUNT,
            TierMessage::GetSporks => opcode::GETSPORKS,
        }
    }
}
