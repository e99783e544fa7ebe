// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use subi_networks::Network;
use subi_types::{NetAddress, OutPoint, TxHash};

/// Command line options of the tier subsystem. File values lose to flags.
#[derive(StructOpt, Debug)]
#[structopt(name = "subi", about = "Subi service-node tier")]
pub struct Cli {
    /// Path to a TOML config file.
    #[structopt(short, long)]
    pub config: Option<PathBuf>,

    /// Chain to follow: mainnet, testnet or regtest.
    #[structopt(long)]
    pub network: Option<Network>,

    /// Directory for tier state dumps.
    #[structopt(long)]
    pub data_dir: Option<PathBuf>,

    /// Run this node as a subinode.
    #[structopt(long)]
    pub subinode: bool,

    /// Service-node secret (base58check).
    #[structopt(long)]
    pub subinode_secret: Option<String>,

    /// Announced external endpoint, e.g. 203.0.113.7:5335.
    #[structopt(long)]
    pub external_ip: Option<NetAddress>,

    /// Collateral transaction of this subinode.
    #[structopt(long)]
    pub collateral_txid: Option<TxHash>,

    /// Output index of the collateral.
    #[structopt(long)]
    pub collateral_vout: Option<u32>,

    /// Spork signing key (network operators only).
    #[structopt(long)]
    pub sporkkey: Option<String>,
}

/// Subinode-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubinodeConfig {
    pub enable: bool,
    pub secret: Option<String>,
    pub external_ip: Option<NetAddress>,
    pub collateral_txid: Option<TxHash>,
    pub collateral_vout: Option<u32>,
}

impl SubinodeConfig {
    pub fn collateral(&self) -> Option<OutPoint> {
        self.collateral_txid
            .map(|txid| OutPoint::new(txid, self.collateral_vout.unwrap_or(0)))
    }
}

/// Full tier configuration, merged from file and flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,
    pub data_dir: Option<PathBuf>,
    pub subinode: SubinodeConfig,
    pub sporkkey: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: Network::Mainnet,
            data_dir: None,
            subinode: SubinodeConfig::default(),
            sporkkey: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("malformed config at {}", path.display()))
    }

    /// Resolve the final configuration from CLI options.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Config> {
        let mut config = match &cli.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(network) = cli.network {
            config.network = network;
        }
        if let Some(data_dir) = &cli.data_dir {
            config.data_dir = Some(data_dir.clone());
        }
        if cli.subinode {
            config.subinode.enable = true;
        }
        if let Some(secret) = &cli.subinode_secret {
            config.subinode.secret = Some(secret.clone());
        }
        if let Some(external_ip) = cli.external_ip {
            config.subinode.external_ip = Some(external_ip);
        }
        if let Some(txid) = cli.collateral_txid {
            config.subinode.collateral_txid = Some(txid);
        }
        if let Some(vout) = cli.collateral_vout {
            config.subinode.collateral_vout = Some(vout);
        }
        if let Some(sporkkey) = &cli.sporkkey {
            config.sporkkey = Some(sporkkey.clone());
        }
        Ok(config)
    }

    /// Directory for the tier dump files.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("org", "subiplatform", "subi")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Initialize logging for the tier processes.
pub fn init_logger() {
    let _ = pretty_env_logger::try_init_timed();
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn file_values_lose_to_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subi.toml");
        std::fs::write(
            &path,
            "network = \"testnet\"\n[subinode]\nenable = false\n",
        )
        .unwrap();

        let cli = Cli::from_iter([
            "subi",
            "--config",
            path.to_str().unwrap(),
            "--network",
            "regtest",
            "--subinode",
        ]);
        let config = Config::resolve(&cli).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert!(config.subinode.enable);
    }

    #[test]
    fn collateral_requires_a_txid() {
        let config = SubinodeConfig::default();
        assert!(config.collateral().is_none());
        let config = SubinodeConfig {
            collateral_txid: Some(subi_types::sha256d(b"tx").into()),
            collateral_vout: Some(1),
            ..SubinodeConfig::default()
        };
        assert_eq!(config.collateral().unwrap().vout, 1);
    }
}
