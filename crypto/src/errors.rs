// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use libsecp256k1::Error as SecpError;
use thiserror::Error;

/// Crypto error
#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The provided service-node secret could not be decoded
    #[error("Malformed secret: {0}")]
    MalformedSecret(String),
    /// Failed to produce a signature
    #[error("Failed to sign data: {0}")]
    SigningError(String),
    /// Signature bytes are not a well formed compact recoverable signature
    #[error("Malformed signature")]
    MalformedSignature,
    /// Signature did not recover to the expected key
    #[error("Signature verification failed")]
    VerificationFailed,
}

impl From<SecpError> for Error {
    fn from(err: SecpError) -> Error {
        match err {
            SecpError::InvalidRecoveryId | SecpError::InvalidSignature => {
                Error::MalformedSignature
            }
            _ => Error::SigningError(format!("{err:?}")),
        }
    }
}

impl From<bs58::decode::Error> for Error {
    fn from(err: bs58::decode::Error) -> Error {
        Error::MalformedSecret(err.to_string())
    }
}
