// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::RwLock;
use subi_crypto::SecretKey;
use subi_types::{NetAddress, OutPoint, PubKey};

#[derive(Default)]
struct LocalIdentityInner {
    service_node: bool,
    outpoint: OutPoint,
    service_pubkey: PubKey,
    service_key: Option<SecretKey>,
    addr: Option<NetAddress>,
}

/// The identity this process runs under when it is itself a subinode.
/// Written by the active-self controller, read by the manager and the
/// payment voter. Empty (and `is_service_node() == false`) otherwise.
#[derive(Default)]
pub struct LocalIdentity {
    inner: RwLock<LocalIdentityInner>,
}

impl LocalIdentity {
    /// Enable service-node mode with the configured service keypair.
    pub fn enable(&self, service_key: SecretKey, service_pubkey: PubKey) {
        let mut inner = self.inner.write();
        inner.service_node = true;
        inner.service_key = Some(service_key);
        inner.service_pubkey = service_pubkey;
    }

    /// Record the collateral and endpoint once the controller has them.
    pub fn set_endpoint(&self, outpoint: OutPoint, addr: NetAddress) {
        let mut inner = self.inner.write();
        inner.outpoint = outpoint;
        inner.addr = Some(addr);
    }

    pub fn is_service_node(&self) -> bool {
        self.inner.read().service_node
    }

    /// Collateral outpoint; null until the controller reaches `Started`.
    pub fn outpoint(&self) -> OutPoint {
        self.inner.read().outpoint
    }

    pub fn service_pubkey(&self) -> PubKey {
        self.inner.read().service_pubkey.clone()
    }

    pub fn service_key(&self) -> Option<SecretKey> {
        self.inner.read().service_key.clone()
    }

    pub fn addr(&self) -> Option<NetAddress> {
        self.inner.read().addr
    }

    /// Whether `key` is our own service key.
    pub fn is_our_service_key(&self, key: &PubKey) -> bool {
        let inner = self.inner.read();
        inner.service_node && !inner.service_pubkey.is_empty() && inner.service_pubkey == *key
    }
}
