// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use subi_types::{hash_of, BlockHash, BlockHeight, Hash256, MsgSignature, NetAddress, OutPoint};

/// Proof-of-service verification message. One wire shape carries three
/// phases, told apart by which signatures are present:
/// a nonce challenge (no signatures), the challenged node's reply (first
/// signature only), and the countersigned broadcast (both signatures).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verify {
    pub vin1: OutPoint,
    pub vin2: OutPoint,
    pub addr: NetAddress,
    pub nonce: u32,
    pub block_height: BlockHeight,
    pub sig1: MsgSignature,
    pub sig2: MsgSignature,
}

impl Verify {
    pub fn request(addr: NetAddress, nonce: u32, block_height: BlockHeight) -> Self {
        Verify {
            vin1: OutPoint::default(),
            vin2: OutPoint::default(),
            addr,
            nonce,
            block_height,
            sig1: MsgSignature::default(),
            sig2: MsgSignature::default(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        hash_of(&(
            &self.vin1,
            &self.vin2,
            &self.addr,
            self.nonce,
            self.block_height,
        ))
    }

    pub fn is_request(&self) -> bool {
        self.sig1.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        !self.sig1.is_empty() && self.sig2.is_empty()
    }

    /// Byte-exact layout covered by the reply signature.
    pub fn reply_message(&self, block_hash: &BlockHash) -> String {
        format!("{}{}{}", self.addr, self.nonce, block_hash.hex())
    }

    /// Byte-exact layout covered by the broadcast countersignature.
    pub fn broadcast_message(&self, block_hash: &BlockHash) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.nonce,
            block_hash.hex(),
            self.vin1.short(),
            self.vin2.short()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subi_types::sha256d;

    #[test]
    fn phases_by_signature_presence() {
        let mut verify = Verify::request("8.8.8.8:5335".parse().unwrap(), 42, 99);
        assert!(verify.is_request());
        verify.sig1 = MsgSignature(vec![1u8; 65]);
        assert!(verify.is_reply());
        verify.sig2 = MsgSignature(vec![2u8; 65]);
        assert!(!verify.is_request() && !verify.is_reply());
    }

    #[test]
    fn broadcast_layout_appends_both_outpoints() {
        let mut verify = Verify::request("8.8.8.8:5335".parse().unwrap(), 42, 99);
        verify.vin1 = OutPoint::new(sha256d(b"one").into(), 0);
        verify.vin2 = OutPoint::new(sha256d(b"two").into(), 1);
        let hash: BlockHash = sha256d(b"block").into();
        let reply = verify.reply_message(&hash);
        let broadcast = verify.broadcast_message(&hash);
        assert!(broadcast.starts_with(&reply));
        assert!(broadcast.ends_with(&verify.vin2.short()));
    }

    #[test]
    fn hash_ignores_signatures() {
        let mut a = Verify::request("8.8.8.8:5335".parse().unwrap(), 7, 10);
        let b = a.clone();
        a.sig1 = MsgSignature(vec![3u8; 65]);
        assert_eq!(a.hash(), b.hash());
    }
}
