// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Error;
use libsecp256k1::{recover, sign, Message, PublicKey, RecoveryId, SecretKey, Signature};
use subi_types::{sha256d, MsgSignature, PubKey};

/// Prefix mixed into every signed message hash so tier signatures can never
/// be replayed as transaction signatures.
pub const MESSAGE_MAGIC: &str = "Subi Signed Message:\n";

/// Compact recoverable signature length: 64 bytes r‖s plus the recovery byte.
pub const COMPACT_SIG_LEN: usize = 65;

fn message_hash(message: &str) -> Message {
    let mut data = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len());
    data.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    data.extend_from_slice(message.as_bytes());
    Message::parse(&sha256d(&data))
}

/// Derive the service-node keypair from a base58check encoded secret.
///
/// Layout: version byte, 32 key bytes, optional compressed-key marker,
/// 4 byte double-SHA256 checksum.
pub fn keys_from_secret(secret: &str) -> Result<(SecretKey, PubKey), Error> {
    let payload = bs58::decode(secret.trim()).into_vec()?;
    if payload.len() < 37 {
        return Err(Error::MalformedSecret("secret is too short".into()));
    }
    let (body, checksum) = payload.split_at(payload.len() - 4);
    if sha256d(body)[..4] != *checksum {
        return Err(Error::MalformedSecret("bad checksum".into()));
    }
    let compressed = match body.len() {
        33 => false,
        34 if body[33] == 0x01 => true,
        _ => return Err(Error::MalformedSecret("bad payload length".into())),
    };
    let key = SecretKey::parse_slice(&body[1..33])
        .map_err(|_| Error::MalformedSecret("not a valid field element".into()))?;
    Ok((key.clone(), public_key(&key, compressed)))
}

/// Serialize the public key for a secret, compressed by default.
pub fn public_key(key: &SecretKey, compressed: bool) -> PubKey {
    let public = PublicKey::from_secret_key(key);
    if compressed {
        PubKey(public.serialize_compressed().to_vec())
    } else {
        PubKey(public.serialize().to_vec())
    }
}

/// Encode a secret key back to its base58check form (compressed marker set).
pub fn secret_to_base58(key: &SecretKey, version: u8) -> String {
    let mut body = Vec::with_capacity(38);
    body.push(version);
    body.extend_from_slice(&key.serialize());
    body.push(0x01);
    let checksum = sha256d(&body);
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

/// Sign a message layout under a service-node key. Deterministic: the same
/// key and message always produce the same signature.
pub fn sign_message(key: &SecretKey, message: &str) -> Result<MsgSignature, Error> {
    let (signature, recovery_id) = sign(&message_hash(message), key);
    let mut bytes = vec![0u8; COMPACT_SIG_LEN];
    bytes[..64].copy_from_slice(&signature.serialize());
    bytes[64] = recovery_id.serialize();
    Ok(MsgSignature(bytes))
}

/// Verify a compact recoverable signature against a public key. The key
/// comparison is by key id so compressed and uncompressed renderings of the
/// same key both verify.
pub fn verify_message(
    public: &PubKey,
    signature: &MsgSignature,
    message: &str,
) -> Result<(), Error> {
    if signature.0.len() != COMPACT_SIG_LEN {
        return Err(Error::MalformedSignature);
    }
    let recovery_id = RecoveryId::parse(signature.0[64])?;
    let mut body = [0u8; 64];
    body.copy_from_slice(&signature.0[..64]);
    let parsed = Signature::parse_standard(&body)?;
    let recovered = recover(&message_hash(message), &parsed, &recovery_id)?;

    let candidates = [
        recovered.serialize_compressed().to_vec(),
        recovered.serialize().to_vec(),
    ];
    if candidates
        .iter()
        .any(|bytes| PubKey(bytes.clone()).key_id() == public.key_id())
    {
        Ok(())
    } else {
        Err(Error::VerificationFailed)
    }
}
