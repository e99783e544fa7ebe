// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::KeyId;
use serde::{Deserialize, Serialize};
use std::fmt;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// An output script. The tier subsystem only ever builds and compares
/// pay-to-key-id scripts, everything else is opaque bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// Standard pay-to-key-id script for a collateral key.
    pub fn pay_to_key_id(id: &KeyId) -> Self {
        let mut bytes = Vec::with_capacity(25);
        bytes.push(OP_DUP);
        bytes.push(OP_HASH160);
        bytes.push(20);
        bytes.extend_from_slice(&id.0);
        bytes.push(OP_EQUALVERIFY);
        bytes.push(OP_CHECKSIG);
        Script(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The key id of a pay-to-key-id script, if the script has that shape.
    pub fn key_id(&self) -> Option<KeyId> {
        if self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 20
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
        {
            let mut id = [0u8; 20];
            id.copy_from_slice(&self.0[3..23]);
            Some(KeyId(id))
        } else {
            None
        }
    }

    /// Script rendering used inside the payment-vote signed layout.
    pub fn asm_string(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_id() {
            Some(id) => write!(f, "p2kh:{id}"),
            None => f.write_str(&self.asm_string()),
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({self})")
    }
}
