// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Flat-file persistence for the tier stores. A dump is a versioned
//! bincode blob; any read problem is treated as "no file" and the caller
//! resyncs from the network.

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

/// Write a versioned dump atomically (temp file + rename).
pub fn save_dump<T: Serialize>(path: &Path, version: &str, value: &T) -> io::Result<()> {
    let bytes = bincode::serialize(&(version.to_owned(), value))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    info!(
        "wrote {} ({} bytes, version {version})",
        path.display(),
        bytes.len()
    );
    Ok(())
}

/// Read a versioned dump. Returns `None` on a missing file, a corrupt file
/// or a version mismatch; the store starts empty in all three cases.
pub fn load_dump<T: DeserializeOwned>(path: &Path, expected_version: &str) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("failed to read {}: {e}", path.display());
            return None;
        }
    };
    let (version, value): (String, T) = match bincode::deserialize(&bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("corrupt dump {}: {e}", path.display());
            return None;
        }
    };
    if version != expected_version {
        warn!(
            "stale dump {} (version {version}, expected {expected_version}), resyncing",
            path.display()
        );
        return None;
    }
    Some(value)
}
