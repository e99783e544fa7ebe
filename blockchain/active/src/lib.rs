// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Lifecycle of this process's own subinode: capability detection, the
//! initial announce, and the periodic ping that keeps it enabled.

#[cfg(test)]
mod active_test;

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use subi_chain::{ChainView, Clock, SyncStatus, WalletView};
use subi_net::{opcode, NetService, PeerView};
use subi_networks::{mainnet_default_port, ChainParams, PROTOCOL_VERSION, SUBINODE_COLLATERAL};
use subi_subinode::{
    Announce, LocalIdentity, PaymentsView, Ping, SubinodeManager, SubinodeState,
    MIN_PING_SECONDS,
};
use subi_types::{NetAddress, OutPoint};

/// Lifecycle states of the active-self controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActiveState {
    Initial,
    SyncInProcess,
    InputTooNew,
    NotCapable,
    Started,
}

impl ActiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveState::Initial => "INITIAL",
            ActiveState::SyncInProcess => "SYNC_IN_PROCESS",
            ActiveState::InputTooNew => "INPUT_TOO_NEW",
            ActiveState::NotCapable => "NOT_CAPABLE",
            ActiveState::Started => "STARTED",
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How this node is being operated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActiveKind {
    Unknown,
    /// Announced by the operator from elsewhere; we only ping.
    Remote,
    /// We hold the collateral and announce ourselves.
    Local,
}

impl ActiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveKind::Unknown => "UNKNOWN",
            ActiveKind::Remote => "REMOTE",
            ActiveKind::Local => "LOCAL",
        }
    }
}

/// Static configuration of the active controller.
pub struct ActiveOptions {
    /// The node accepts inbound connections.
    pub listening: bool,
    /// Configured external endpoint, if any.
    pub external_addr: Option<NetAddress>,
    /// Pin the collateral search to one outpoint.
    pub collateral: Option<OutPoint>,
}

struct ActiveInner {
    state: ActiveState,
    kind: ActiveKind,
    pinger_enabled: bool,
    not_capable_reason: String,
    service_addr: Option<NetAddress>,
    outpoint: OutPoint,
}

/// Responsible for activating this subinode and pinging the network.
pub struct ActiveSubinode {
    inner: RwLock<ActiveInner>,
    opts: ActiveOptions,
    identity: Arc<LocalIdentity>,
    manager: Arc<SubinodeManager>,
    chain: Arc<dyn ChainView>,
    clock: Arc<dyn Clock>,
    params: &'static ChainParams,
    net: NetService,
    wallet: Arc<dyn WalletView>,
    peers: Arc<dyn PeerView>,
    sync: Arc<SyncStatus>,
}

impl ActiveSubinode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: ActiveOptions,
        identity: Arc<LocalIdentity>,
        manager: Arc<SubinodeManager>,
        chain: Arc<dyn ChainView>,
        clock: Arc<dyn Clock>,
        params: &'static ChainParams,
        net: NetService,
        wallet: Arc<dyn WalletView>,
        peers: Arc<dyn PeerView>,
        sync: Arc<SyncStatus>,
    ) -> Self {
        ActiveSubinode {
            inner: RwLock::new(ActiveInner {
                state: ActiveState::Initial,
                kind: ActiveKind::Unknown,
                pinger_enabled: false,
                not_capable_reason: String::new(),
                service_addr: None,
                outpoint: OutPoint::default(),
            }),
            opts,
            identity,
            manager,
            chain,
            clock,
            params,
            net,
            wallet,
            peers,
            sync,
        }
    }

    pub fn state(&self) -> ActiveState {
        self.inner.read().state
    }

    pub fn kind(&self) -> ActiveKind {
        self.inner.read().kind
    }

    pub fn outpoint(&self) -> OutPoint {
        self.inner.read().outpoint
    }

    /// Human-readable status for the UI and RPC.
    pub fn status_text(&self) -> String {
        let inner = self.inner.read();
        match inner.state {
            ActiveState::Initial => "Node just started, not yet activated".to_owned(),
            ActiveState::SyncInProcess => {
                "Sync in progress. Must wait until sync is complete to start Subinode".to_owned()
            }
            ActiveState::InputTooNew => format!(
                "Subinode input must have at least {} confirmations",
                self.params.min_collateral_confirmations
            ),
            ActiveState::NotCapable => {
                format!("Not capable subinode: {}", inner.not_capable_reason)
            }
            ActiveState::Started => "Subinode successfully started".to_owned(),
        }
    }

    fn not_capable(&self, inner: &mut ActiveInner, reason: &str) {
        inner.state = ActiveState::NotCapable;
        inner.not_capable_reason = reason.to_owned();
        warn!("active subinode {}: {reason}", inner.state);
    }

    /// Periodic state management; drives detection, announce and pings.
    pub fn manage(&self, payments: &dyn PaymentsView) {
        if !self.identity.is_service_node() {
            return;
        }

        if !self.params.network.is_regtest() && !self.sync.is_blockchain_synced() {
            self.inner.write().state = ActiveState::SyncInProcess;
            return;
        }
        {
            let mut inner = self.inner.write();
            if inner.state == ActiveState::SyncInProcess {
                inner.state = ActiveState::Initial;
            }
        }

        if self.kind() == ActiveKind::Unknown {
            self.manage_initial();
        }
        match self.kind() {
            ActiveKind::Remote => self.manage_remote(payments),
            ActiveKind::Local => {
                // Try the remote path first: a started node can resume
                // without recreating its announce.
                self.manage_remote(payments);
                if self.state() != ActiveState::Started {
                    self.manage_local();
                }
            }
            ActiveKind::Unknown => {}
        }

        self.send_ping();
    }

    /// Detect capability: external endpoint, port policy, wallet funds.
    fn manage_initial(&self) {
        let mut inner = self.inner.write();

        if !self.opts.listening {
            // The listen option is probably overwritten by something else.
            self.not_capable(
                &mut inner,
                "Subinode must accept connections from outside. Make sure the listen \
                 configuration option is not overwritten by some other parameter.",
            );
            return;
        }

        let addr = match self.opts.external_addr {
            Some(addr) => Some(addr),
            None => {
                if self.peers.peers().is_empty() {
                    self.not_capable(
                        &mut inner,
                        "Can't detect valid external address. Will retry when there are \
                         some connections available.",
                    );
                    return;
                }
                None
            }
        };
        let Some(addr) = addr.filter(|addr| self.is_valid_net_addr(addr)) else {
            self.not_capable(
                &mut inner,
                "Can't detect valid external address. Please consider using the \
                 externalip configuration option if the problem persists. Make sure \
                 to use an IPv4 address only.",
            );
            return;
        };

        let mainnet_port = mainnet_default_port();
        if self.params.network.is_mainnet() {
            if addr.port() != mainnet_port {
                self.not_capable(
                    &mut inner,
                    &format!(
                        "Invalid port: {} - only {mainnet_port} is supported on mainnet.",
                        addr.port()
                    ),
                );
                return;
            }
        } else if addr.port() == mainnet_port {
            self.not_capable(
                &mut inner,
                &format!(
                    "Invalid port: {} - {mainnet_port} is only supported on mainnet.",
                    addr.port()
                ),
            );
            return;
        }

        // Probe an outbound connection to our own advertised endpoint; the
        // connection manager reports failures through its own channel.
        debug!("checking inbound connection to {addr}");
        self.net.connect_and_send(addr, Vec::new());
        inner.service_addr = Some(addr);

        // Default to remote operation.
        inner.kind = ActiveKind::Remote;

        // Check if wallet funds are available for local operation.
        if self.wallet.is_locked() {
            debug!("wallet is locked, staying in remote mode");
            return;
        }
        if self.wallet.balance() < SUBINODE_COLLATERAL {
            debug!("wallet balance is below the collateral, staying in remote mode");
            return;
        }
        if self.wallet.find_collateral(self.opts.collateral).is_some() {
            inner.kind = ActiveKind::Local;
        }
    }

    fn is_valid_net_addr(&self, addr: &NetAddress) -> bool {
        // Regtest is fine with any address.
        self.params.network.is_regtest() || (addr.is_ipv4() && addr.is_routable())
    }

    /// Resume a node somebody already announced for us.
    fn manage_remote(&self, payments: &dyn PaymentsView) {
        let service_pubkey = self.identity.service_pubkey();
        self.manager
            .check_subinode_by_key(&service_pubkey, false, payments);
        let info = self.manager.info_by_service_key(&service_pubkey);

        let mut inner = self.inner.write();
        let Some(info) = info else {
            self.not_capable(&mut inner, "Subinode not in subinode list");
            return;
        };

        if info.protocol_version != PROTOCOL_VERSION {
            self.not_capable(&mut inner, "Invalid protocol version");
            return;
        }
        if inner.service_addr.map(|addr| addr != info.addr).unwrap_or(false) {
            self.not_capable(
                &mut inner,
                "Broadcasted IP doesn't match our external address. Make sure you issued \
                 a new broadcast if the IP of this subinode changed recently.",
            );
            return;
        }
        if !info.state.valid_for_auto_start() {
            let reason = format!("Subinode in {} state", info.state);
            self.not_capable(&mut inner, &reason);
            return;
        }
        if inner.state != ActiveState::Started {
            info!("active subinode STARTED remotely, outpoint={}", info.outpoint.short());
            inner.outpoint = info.outpoint;
            inner.service_addr = Some(info.addr);
            inner.pinger_enabled = true;
            inner.state = ActiveState::Started;
            self.identity.set_endpoint(info.outpoint, info.addr);
        }
    }

    /// Announce ourselves from the local wallet's collateral.
    fn manage_local(&self) {
        let mut inner = self.inner.write();
        if inner.state == ActiveState::Started {
            return;
        }

        let Some(collateral) = self.wallet.find_collateral(self.opts.collateral) else {
            return;
        };

        let tip = self.chain.tip_height().unwrap_or_default();
        let age = self
            .chain
            .utxo(&collateral.outpoint)
            .map(|coin| tip - coin.height + 1)
            .unwrap_or(0);
        if age < self.params.min_collateral_confirmations {
            inner.state = ActiveState::InputTooNew;
            inner.not_capable_reason =
                format!("{} - {age} confirmations", self.status_text_for_input_too_new());
            warn!("active subinode: {}", inner.not_capable_reason);
            return;
        }

        self.wallet.lock_coin(&collateral.outpoint);

        let Some(addr) = inner.service_addr else {
            self.not_capable(&mut inner, "No external address detected");
            return;
        };
        let Some(service_key) = self.identity.service_key() else {
            self.not_capable(&mut inner, "No service key loaded");
            return;
        };

        let announce = match Announce::create(
            collateral.outpoint,
            addr,
            &collateral.secret,
            collateral.pubkey.clone(),
            &service_key,
            self.identity.service_pubkey(),
            self.params,
            &*self.chain,
            &*self.clock,
        ) {
            Ok(announce) => announce,
            Err(error) => {
                let reason = format!("Error creating subinode broadcast: {error}");
                self.not_capable(&mut inner, &reason);
                return;
            }
        };

        inner.pinger_enabled = true;
        inner.state = ActiveState::Started;
        inner.outpoint = collateral.outpoint;
        self.identity.set_endpoint(collateral.outpoint, addr);
        drop(inner);

        info!(
            "active subinode STARTED locally, outpoint={}",
            announce.outpoint.short()
        );
        self.manager.update_subinode_list(announce.clone());
        self.net.broadcast(opcode::MNANNOUNCE, &announce);
    }

    fn status_text_for_input_too_new(&self) -> String {
        format!(
            "Subinode input must have at least {} confirmations",
            self.params.min_collateral_confirmations
        )
    }

    /// Ping at most once per interval while started.
    pub fn send_ping(&self) -> bool {
        let (pinger_enabled, outpoint) = {
            let inner = self.inner.read();
            (inner.pinger_enabled, inner.outpoint)
        };
        if !pinger_enabled {
            return false;
        }

        if !self.manager.has(&outpoint) {
            let mut inner = self.inner.write();
            self.not_capable(&mut inner, "Subinode not in subinode list");
            return false;
        }

        let Some(service_key) = self.identity.service_key() else {
            return false;
        };
        let Some(mut ping) = Ping::create(outpoint, &*self.chain, &*self.clock) else {
            return false;
        };
        if !ping.sign(&service_key, &self.identity.service_pubkey(), self.clock.now()) {
            warn!("couldn't sign subinode ping");
            return false;
        }

        if self
            .manager
            .is_pinged_within(&outpoint, MIN_PING_SECONDS, ping.sig_time)
        {
            debug!("too early to send a subinode ping");
            return false;
        }

        self.manager.set_last_ping(&outpoint, ping.clone());
        debug!("relaying subinode ping, collateral={}", outpoint.short());
        self.net.broadcast(opcode::MNPING, &ping);
        true
    }

    /// Our record may be in a restartable state; re-run detection so a
    /// remote re-announce can pick us back up.
    pub fn updated_block_tip(&self) {
        let mut inner = self.inner.write();
        if inner.state == ActiveState::Started
            && self.manager.state_of(&inner.outpoint) == SubinodeState::NewStartRequired
        {
            inner.state = ActiveState::Initial;
            inner.kind = ActiveKind::Unknown;
            inner.pinger_enabled = false;
        }
    }
}
