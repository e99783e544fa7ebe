// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::hash160;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialized secp256k1 public key (33 bytes compressed or 65 uncompressed).
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PubKey(pub Vec<u8>);

impl PubKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key id: RIPEMD160(SHA256(serialized key)).
    pub fn key_id(&self) -> KeyId {
        KeyId(hash160(&self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(&self.0))
    }
}

/// 20-byte key id, the hash160 of a public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 20]);

impl KeyId {
    /// Hex rendering used inside signed message layouts.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.hex())
    }
}

/// Compact recoverable ECDSA signature: 64 bytes r‖s plus a recovery byte.
/// An empty signature marks a record as not yet signed or not verified.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MsgSignature(pub Vec<u8>);

impl MsgSignature {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl fmt::Debug for MsgSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgSignature({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_matches_hash160() {
        let key = PubKey(vec![2u8; 33]);
        assert_eq!(key.key_id().0, hash160(&[2u8; 33]));
    }

    #[test]
    fn empty_signature_marker() {
        let mut sig = MsgSignature(vec![1u8; 65]);
        assert!(!sig.is_empty());
        sig.clear();
        assert!(sig.is_empty());
    }
}
