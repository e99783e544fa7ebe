// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::MNPAYMENTS_SIGNATURES_REQUIRED;
use serde::{Deserialize, Serialize};
use std::fmt;
use subi_chain::PaymentSchedule;
use subi_crypto::SecretKey;
use subi_subinode::Rejected;
use subi_types::{hash_of, BlockHeight, Hash256, MsgSignature, OutPoint, PubKey, Script, Transaction};

/// A subinode's signed choice of payee for one target height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVote {
    pub voter: OutPoint,
    pub block_height: BlockHeight,
    pub payee: Script,
    pub sig: MsgSignature,
}

impl PaymentVote {
    pub fn new(voter: OutPoint, block_height: BlockHeight, payee: Script) -> Self {
        PaymentVote {
            voter,
            block_height,
            payee,
            sig: MsgSignature::default(),
        }
    }

    /// Deterministic in (payee, target height, voter outpoint) only; the
    /// signature never contributes.
    pub fn hash(&self) -> Hash256 {
        hash_of(&(&self.payee, self.block_height, &self.voter))
    }

    /// Byte-exact layout covered by the vote signature.
    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}",
            self.voter.short(),
            self.block_height,
            self.payee.asm_string()
        )
    }

    pub fn sign(&mut self, key: &SecretKey, service_pubkey: &PubKey) -> bool {
        let message = self.signed_message();
        match subi_crypto::sign_message(key, &message) {
            Ok(sig) => {
                self.sig = sig;
                subi_crypto::verify_message(service_pubkey, &self.sig, &message).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Verify the vote signature. Only a bad signature on a future-block
    /// vote from a synced node is worth penalizing; otherwise the voter may
    /// simply have rotated its service key.
    pub fn check_signature(
        &self,
        service_pubkey: &PubKey,
        validation_height: BlockHeight,
        list_synced: bool,
    ) -> Result<(), Rejected> {
        if subi_crypto::verify_message(service_pubkey, &self.sig, &self.signed_message()).is_err()
        {
            let dos = if list_synced && self.block_height > validation_height {
                20
            } else {
                0
            };
            return Err(Rejected::new(
                dos,
                format!("bad payment vote signature, subinode={}", self.voter.short()),
            ));
        }
        Ok(())
    }

    pub fn is_verified(&self) -> bool {
        !self.sig.is_empty()
    }

    pub fn mark_not_verified(&mut self) {
        self.sig.clear();
    }
}

impl fmt::Display for PaymentVote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.voter.short(),
            self.block_height,
            self.payee,
            self.sig.as_bytes().len()
        )
    }
}

/// Votes aggregated for one payee script at one height.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payee {
    script: Script,
    vote_hashes: Vec<Hash256>,
}

impl Payee {
    pub fn new(script: Script, first_vote: Hash256) -> Self {
        Payee {
            script,
            vote_hashes: vec![first_vote],
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn add_vote_hash(&mut self, hash: Hash256) {
        self.vote_hashes.push(hash);
    }

    pub fn vote_hashes(&self) -> &[Hash256] {
        &self.vote_hashes
    }

    pub fn vote_count(&self) -> usize {
        self.vote_hashes.len()
    }
}

/// Ordered set of payee buckets for one target height.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockPayees {
    pub height: BlockHeight,
    pub payees: Vec<Payee>,
}

impl BlockPayees {
    pub fn new(height: BlockHeight) -> Self {
        BlockPayees {
            height,
            payees: Vec::new(),
        }
    }

    pub fn add_vote(&mut self, vote: &PaymentVote) {
        let hash = vote.hash();
        for payee in &mut self.payees {
            if *payee.script() == vote.payee {
                payee.add_vote_hash(hash);
                return;
            }
        }
        self.payees.push(Payee::new(vote.payee.clone(), hash));
    }

    /// The bucket with the most votes; insertion order breaks ties.
    pub fn best_payee(&self) -> Option<Script> {
        let mut best: Option<(&Payee, usize)> = None;
        for payee in &self.payees {
            if best.map(|(_, votes)| payee.vote_count() > votes).unwrap_or(true) {
                best = Some((payee, payee.vote_count()));
            }
        }
        best.map(|(payee, _)| payee.script().clone())
    }

    pub fn has_payee_with_votes(&self, script: &Script, min_votes: usize) -> bool {
        self.payees
            .iter()
            .any(|payee| payee.vote_count() >= min_votes && payee.script() == script)
    }

    pub fn max_signatures(&self) -> usize {
        self.payees
            .iter()
            .map(Payee::vote_count)
            .max()
            .unwrap_or(0)
    }

    /// Whether a coinbase/coinstake satisfies this height's election: with
    /// fewer than the required signatures anything goes; otherwise some
    /// sufficiently-voted bucket must be paid the exact expected amount.
    pub fn is_transaction_valid(&self, tx: &Transaction, schedule: &dyn PaymentSchedule) -> bool {
        if self.max_signatures() < MNPAYMENTS_SIGNATURES_REQUIRED {
            return true;
        }
        let payment = schedule.subinode_payment(self.height, tx.total_out());
        let mut has_valid_payee = false;
        for payee in &self.payees {
            if payee.vote_count() >= MNPAYMENTS_SIGNATURES_REQUIRED {
                has_valid_payee = true;
                if tx.pays(payee.script(), payment) {
                    return true;
                }
            }
        }
        !has_valid_payee
    }

    /// Human-readable election summary for RPC and logs.
    pub fn required_payments_string(&self) -> String {
        let mut out = String::new();
        for payee in &self.payees {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(&format!("{}:{}", payee.script(), payee.vote_count()));
        }
        if out.is_empty() {
            out.push_str("Unknown");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subi_chain::test_util::FlatSchedule;
    use subi_types::{hash160, sha256d, KeyId, TxOut, COIN};

    fn vote(height: BlockHeight, voter_tag: &[u8], payee: &Script) -> PaymentVote {
        PaymentVote::new(
            OutPoint::new(sha256d(voter_tag).into(), 0),
            height,
            payee.clone(),
        )
    }

    fn payee(tag: &[u8]) -> Script {
        Script::pay_to_key_id(&KeyId(hash160(tag)))
    }

    #[test]
    fn vote_hash_ignores_signature() {
        let mut a = vote(10, b"v1", &payee(b"p1"));
        let b = a.clone();
        a.sig = MsgSignature(vec![9u8; 65]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), vote(11, b"v1", &payee(b"p1")).hash());
        assert_ne!(a.hash(), vote(10, b"v2", &payee(b"p1")).hash());
        assert_ne!(a.hash(), vote(10, b"v1", &payee(b"p2")).hash());
    }

    #[test]
    fn best_payee_breaks_ties_by_insertion_order() {
        let mut block = BlockPayees::new(10);
        block.add_vote(&vote(10, b"a", &payee(b"first")));
        block.add_vote(&vote(10, b"b", &payee(b"second")));
        assert_eq!(block.best_payee(), Some(payee(b"first")));

        block.add_vote(&vote(10, b"c", &payee(b"second")));
        assert_eq!(block.best_payee(), Some(payee(b"second")));
    }

    #[test]
    fn transaction_validation_follows_the_election() {
        let winner = payee(b"winner");
        let loser = payee(b"loser");
        let mut block = BlockPayees::new(1000);
        for i in 0..7u8 {
            block.add_vote(&vote(1000, &[b'w', i], &winner));
        }
        for i in 0..3u8 {
            block.add_vote(&vote(1000, &[b'l', i], &loser));
        }

        let schedule = FlatSchedule::default();
        // 1000 coins out, of which three tenths go to the subinode.
        let total = 1000 * COIN;
        let payment = 300 * COIN;
        let paid_winner = Transaction::new(vec![
            TxOut::new(total - payment, Script(vec![0x51])),
            TxOut::new(payment, winner.clone()),
        ]);
        let paid_loser = Transaction::new(vec![
            TxOut::new(total - payment, Script(vec![0x51])),
            TxOut::new(payment, loser.clone()),
        ]);
        let underpaid = Transaction::new(vec![
            TxOut::new(total - payment + 1, Script(vec![0x51])),
            TxOut::new(payment - 1, winner.clone()),
        ]);
        assert!(block.is_transaction_valid(&paid_winner, &schedule));
        assert!(!block.is_transaction_valid(&paid_loser, &schedule));
        assert!(!block.is_transaction_valid(&underpaid, &schedule));
    }

    #[test]
    fn insufficient_votes_accept_anything() {
        let mut block = BlockPayees::new(1000);
        for i in 0..(MNPAYMENTS_SIGNATURES_REQUIRED - 1) as u8 {
            block.add_vote(&vote(1000, &[b'x', i], &payee(b"p")));
        }
        let schedule = FlatSchedule::default();
        let tx = Transaction::new(vec![TxOut::new(100, Script(vec![0x51]))]);
        assert!(block.is_transaction_valid(&tx, &schedule));
    }

    #[test]
    fn payments_string_lists_buckets() {
        let mut block = BlockPayees::new(5);
        assert_eq!(block.required_payments_string(), "Unknown");
        block.add_vote(&vote(5, b"a", &payee(b"p")));
        assert!(block.required_payments_string().contains(":1"));
    }
}
