//! Core ledger data and chain persistence
//!
//! Blocks, the opaque transaction and account records they carry, and the
//! chain manager that stores them in sled.

pub mod account;
pub mod block;
pub mod blockchain;
pub mod transaction;

pub use account::{Account, AccountSink, Role};
pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator};
pub use transaction::Transaction;
