// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

mod errors;
mod signer;

pub use self::errors::Error;
pub use self::signer::*;

pub use libsecp256k1::SecretKey;
