//! Secondary storage maintained alongside the chain
//!
//! The chain itself lives in `core::blockchain`; this module holds the
//! indexing sink that every appended block is handed to.

pub mod tx_index;

pub use tx_index::{BlockIndexer, TransactionIndex};
