//! Test utilities for chain and overlay testing

use crate::core::{Account, AccountSink, Block, Blockchain};
use crate::error::{LedgerError, Result};
use crate::network::{Dispatcher, Overlay, OverlayConfig};
use crate::storage::BlockIndexer;
use crate::utils::new_node_keypair;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Create a temporary directory for testing
pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| LedgerError::Io(e.to_string()))
}

/// Create a chain holding only genesis, in temporary storage
pub fn create_test_blockchain() -> Result<(Blockchain, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let blockchain = Blockchain::create(temp_dir.path().join("chain"))?;
    Ok((blockchain, temp_dir))
}

/// Indexer that records what it was given, optionally failing every call
#[derive(Default)]
pub struct RecordingIndexer {
    indexed: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingIndexer {
    pub fn failing() -> Self {
        Self {
            indexed: Mutex::new(vec![]),
            fail: true,
        }
    }

    pub fn indexed(&self) -> Vec<String> {
        self.indexed.lock().unwrap().clone()
    }
}

impl BlockIndexer for RecordingIndexer {
    fn index_block(&self, block: &Block) -> Result<()> {
        self.indexed.lock().unwrap().push(block.get_hash().to_string());
        if self.fail {
            return Err(LedgerError::StorageIo("index unavailable".to_string()));
        }
        Ok(())
    }
}

/// Account sink that keeps everything in memory
#[derive(Default)]
pub struct RecordingSink {
    accounts: Mutex<Vec<(Vec<u8>, Account)>>,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<(Vec<u8>, Account)> {
        self.accounts.lock().unwrap().clone()
    }
}

impl AccountSink for RecordingSink {
    fn register_account(&self, address: &[u8], account: &Account) -> Result<()> {
        self.accounts
            .lock()
            .unwrap()
            .push((address.to_vec(), account.clone()));
        Ok(())
    }
}

/// Overlay settings for a node on an ephemeral loopback port
pub fn local_overlay_config() -> OverlayConfig {
    OverlayConfig {
        bind_host: "127.0.0.1".parse().unwrap(),
        bind_port: 0,
        advertise_address: None,
        timeout: Duration::from_secs(2),
        bucket_size: 16,
        alpha: 3,
    }
}

/// Start a loopback overlay node with a fresh identity
pub fn start_test_overlay(dispatcher: Dispatcher, seeds: &[String]) -> Result<Overlay> {
    Overlay::start(
        local_overlay_config(),
        new_node_keypair(),
        Arc::new(dispatcher),
        seeds,
    )
}

/// An address nothing is listening on
pub fn closed_port_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
