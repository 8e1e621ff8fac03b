use crate::core::Block;
use crate::error::{LedgerError, Result};
use data_encoding::HEXLOWER;
use log::debug;
use sled::{Db, Tree};
use std::time::Instant;

const TX_INDEX_TREE: &str = "tx-index";

/// Receives every block after it has been durably appended.
///
/// Failures are reported back to the chain, which logs them and carries on:
/// the block is already committed by the time the indexer sees it.
pub trait BlockIndexer: Send + Sync {
    fn index_block(&self, block: &Block) -> Result<()>;
}

/// ( K -> txid_hex, V -> block hash )
pub struct TransactionIndex {
    tree: Tree,
}

impl TransactionIndex {
    pub fn new(db: &Db) -> Result<TransactionIndex> {
        let tree = db
            .open_tree(TX_INDEX_TREE)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to open tx index tree: {e}")))?;
        Ok(TransactionIndex { tree })
    }

    pub fn find_block_hash(&self, txid: &[u8]) -> Result<Option<String>> {
        let key = HEXLOWER.encode(txid);
        match self
            .tree
            .get(key)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to read tx index: {e}")))?
        {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| LedgerError::StorageIo(format!("Invalid block hash in index: {e}"))),
            None => Ok(None),
        }
    }
}

impl BlockIndexer for TransactionIndex {
    fn index_block(&self, block: &Block) -> Result<()> {
        let start = Instant::now();
        debug!(
            "number of transactions in the block: {}",
            block.get_transactions().len()
        );

        let mut batch = sled::Batch::default();
        for tx in block.get_transactions() {
            batch.insert(HEXLOWER.encode(tx.get_id()).as_bytes(), block.get_hash().as_bytes());
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to index block: {e}")))?;

        debug!(
            "indexed block {} in {}ms",
            block.get_hash(),
            start.elapsed().as_millis()
        );
        Ok(())
    }
}
