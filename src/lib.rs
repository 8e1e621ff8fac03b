//! # Ledger Node
//!
//! A node in a peer-to-peer ledger network: a locally persisted, append-only
//! chain of blocks plus a self-organizing overlay that replicates accounts and
//! block announcements to other nodes.
//!
//! ## Layout
//! - `core/`: blocks, transactions, accounts and the chain manager over sled
//! - `storage/`: secondary indexes fed after each append
//! - `network/`: libp2p overlay (Kademlia, Noise), wire codec, broadcast, dispatch
//! - `config/`: settings from defaults, TOML and environment
//! - `utils/`: hashing, key generation, bincode helpers
//! - `cli/`: command-line parsing
//!
//! ## Where to start
//! 1. `main.rs` for the commands
//! 2. `core/blockchain.rs` for how blocks are linked and stored
//! 3. `network/overlay.rs` for discovery and the swarm event loop
//! 4. `network/dispatcher.rs` for how received objects reach the store
//!
//! Consensus, fork choice and transaction semantics live outside this crate.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

pub use cli::{AttributeArg, Command, Opt};
pub use config::Settings;
pub use core::{Account, AccountSink, Block, Blockchain, BlockchainIterator, Role, Transaction};
pub use error::{LedgerError, Result};
pub use network::{
    AccountHandler, BlockAnnouncementHandler, Delivery, Dispatcher, HandlerContext, Message,
    MessageHandler, Overlay, OverlayConfig, OverlayEvents, PeerId, PeerIdentity,
};
pub use libp2p::identity::Keypair;
pub use storage::{BlockIndexer, TransactionIndex};
pub use utils::{current_timestamp, new_node_keypair, sha256_digest, sha256_hex};
