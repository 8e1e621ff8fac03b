use crate::error::{LedgerError, Result};
use crate::network::{
    parse_address, OverlayConfig, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE, DEFAULT_PORT,
};
use crate::utils::{decode_node_keypair, encode_node_keypair, new_node_keypair};
use libp2p::identity::Keypair;
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATA_DIR_KEY: &str = "LEDGER_DATA_DIR";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const ADVERTISE_ADDRESS_KEY: &str = "ADVERTISE_ADDRESS";
const SEED_NODES_KEY: &str = "SEED_NODES";

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

const CHAIN_DIR: &str = "chain";
const NODE_KEY_FILE: &str = "node.key";

/// Node settings. Layered as defaults, then an optional TOML file, then
/// environment variables; the CLI applies its flags last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub bind_host: IpAddr,
    pub bind_port: u16,
    pub advertise_address: Option<String>,
    pub seeds: Vec<String>,
    pub network_timeout_secs: u64,
    pub bucket_size: usize,
    pub alpha: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            advertise_address: None,
            seeds: vec![],
            network_timeout_secs: DEFAULT_TIMEOUT_SECS,
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Settings> {
        let mut settings = match config_file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    LedgerError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                Settings::from_toml_str(&text)?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Settings> {
        toml::from_str(text).map_err(|e| LedgerError::Config(format!("Invalid config file: {e}")))
    }

    /// Apply environment-style overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            let socket_addr: SocketAddr = addr.trim().parse().map_err(|e| {
                LedgerError::Config(format!("{NODE_ADDRESS_KEY} must be host:port, got {addr}: {e}"))
            })?;
            self.bind_host = socket_addr.ip();
            self.bind_port = socket_addr.port();
        }
        if let Some(addr) = lookup(ADVERTISE_ADDRESS_KEY) {
            self.advertise_address = Some(addr.trim().to_string());
        }
        if let Some(seeds) = lookup(SEED_NODES_KEY) {
            self.seeds = seeds
                .split(',')
                .map(str::trim)
                .filter(|seed| !seed.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_timeout_secs == 0 {
            return Err(LedgerError::Config(
                "network_timeout_secs must be positive".to_string(),
            ));
        }
        if self.bucket_size == 0 || self.alpha == 0 {
            return Err(LedgerError::Config(
                "bucket_size and alpha must be positive".to_string(),
            ));
        }
        for seed in &self.seeds {
            parse_address(seed)?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(CHAIN_DIR)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(NODE_KEY_FILE)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            bind_host: self.bind_host,
            bind_port: self.bind_port,
            advertise_address: self.advertise_address.clone(),
            timeout: self.network_timeout(),
            bucket_size: self.bucket_size,
            alpha: self.alpha,
        }
    }

    /// Read the node's identity key, generating and storing one on first use.
    pub fn load_or_create_node_key(&self) -> Result<Keypair> {
        let path = self.key_path();
        if path.exists() {
            let keypair = decode_node_keypair(&fs::read(&path)?)?;
            info!(
                "Loaded node identity {} from {}",
                keypair.public().to_peer_id(),
                path.display()
            );
            return Ok(keypair);
        }

        fs::create_dir_all(&self.data_dir)?;
        let keypair = new_node_keypair();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(&encode_node_keypair(&keypair)?)?;
        file.sync_all()?;
        info!(
            "Generated node identity {} at {}",
            keypair.public().to_peer_id(),
            path.display()
        );
        Ok(keypair)
    }
}
