// The chain manager: owns the on-disk chain inside a sled database.
// Blocks are keyed by their content hash in the "blocks" tree, next to two
// reserved metadata keys holding the tip hash and its height. Every write that
// moves the tip happens inside a single sled transaction.

use crate::core::{Account, AccountSink, Block, Transaction};
use crate::error::{LedgerError, Result};
use crate::storage::{BlockIndexer, TransactionIndex};
use log::{error, info};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "tip-hash"; // Hash of the latest block
const HEIGHT_KEY: &str = "height"; // Decimal height of the latest block
const BLOCKS_TREE: &str = "blocks";
const ACCOUNTS_TREE: &str = "accounts";

/// Session handle over one chain store.
///
/// Clones share the store, the cached tip and the append lock, but each clone
/// gets its own cursor positioned at the tip.
pub struct Blockchain {
    tip_hash: Arc<RwLock<String>>,
    cursor: Mutex<String>,
    db: Db,
    blocks: Tree,
    accounts: Tree,
    db_path: PathBuf,
    tx_index: Arc<TransactionIndex>,
    indexer: Arc<dyn BlockIndexer>,
    append_lock: Arc<Mutex<()>>,
}

impl Clone for Blockchain {
    fn clone(&self) -> Self {
        Blockchain {
            tip_hash: Arc::clone(&self.tip_hash),
            cursor: Mutex::new(self.get_tip_hash()),
            db: self.db.clone(),
            blocks: self.blocks.clone(),
            accounts: self.accounts.clone(),
            db_path: self.db_path.clone(),
            tx_index: Arc::clone(&self.tx_index),
            indexer: Arc::clone(&self.indexer),
            append_lock: Arc::clone(&self.append_lock),
        }
    }
}

impl Blockchain {
    pub fn db_exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }

    /// Open an existing chain. The cursor starts at the persisted tip.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Blockchain> {
        let path = path.as_ref();
        if !Self::db_exists(path) {
            return Err(LedgerError::NotFound(path.display().to_string()));
        }

        let db = sled::open(path)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to open database: {e}")))?;
        let blocks = Self::open_tree(&db, BLOCKS_TREE)?;
        let tip_hash = Self::read_tip(&blocks)?.ok_or_else(|| {
            LedgerError::StorageIo(format!(
                "Store at {} holds no chain metadata",
                path.display()
            ))
        })?;

        info!("Opened chain at {} with tip {tip_hash}", path.display());
        Self::from_parts(db, blocks, path, tip_hash)
    }

    /// Create a new chain holding only the genesis block.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Blockchain> {
        let path = path.as_ref();
        if Self::db_exists(path) {
            return Err(LedgerError::AlreadyExists(path.display().to_string()));
        }

        let genesis = Block::generate_genesis_block()?;
        let db = sled::open(path)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to open database: {e}")))?;
        let blocks = Self::open_tree(&db, BLOCKS_TREE)?;

        Self::commit_block(&blocks, &genesis, None)?;
        db.flush()
            .map_err(|e| LedgerError::StorageIo(format!("Failed to flush database: {e}")))?;
        info!("Created genesis block {}", genesis.get_hash());

        let blockchain = Self::from_parts(db, blocks, path, genesis.get_hash().to_string())?;
        blockchain.index(&genesis);
        Ok(blockchain)
    }

    fn from_parts(db: Db, blocks: Tree, path: &Path, tip_hash: String) -> Result<Blockchain> {
        let accounts = Self::open_tree(&db, ACCOUNTS_TREE)?;
        let tx_index = Arc::new(TransactionIndex::new(&db)?);

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.clone())),
            cursor: Mutex::new(tip_hash),
            db,
            blocks,
            accounts,
            db_path: path.to_path_buf(),
            indexer: Arc::clone(&tx_index) as Arc<dyn BlockIndexer>,
            tx_index,
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Replace the indexing sink that receives appended blocks.
    pub fn with_indexer(mut self, indexer: Arc<dyn BlockIndexer>) -> Blockchain {
        self.indexer = indexer;
        self
    }

    fn open_tree(db: &Db, name: &str) -> Result<Tree> {
        db.open_tree(name)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to open {name} tree: {e}")))
    }

    fn read_tip(blocks: &Tree) -> Result<Option<String>> {
        let data = blocks
            .get(TIP_BLOCK_HASH_KEY)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to get tip hash: {e}")))?;
        data.map(|bytes| {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| LedgerError::StorageIo(format!("Invalid tip hash format: {e}")))
        })
        .transpose()
    }

    fn read_height(blocks: &Tree) -> Result<Option<u64>> {
        let data = blocks
            .get(HEIGHT_KEY)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to get height: {e}")))?;
        data.map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .parse::<u64>()
                .map_err(|e| LedgerError::StorageIo(format!("Invalid height format: {e}")))
        })
        .transpose()
    }

    /// Tip hash and height as currently persisted. Missing metadata is an error:
    /// appending on top of an unknown tip would fork the chain from nothing.
    fn read_metadata(&self) -> Result<(String, u64)> {
        let tip = Self::read_tip(&self.blocks)?
            .ok_or_else(|| LedgerError::StorageIo("Tip hash is missing".to_string()))?;
        let height = Self::read_height(&self.blocks)?
            .ok_or_else(|| LedgerError::StorageIo("Chain height is missing".to_string()))?;
        Ok((tip, height))
    }

    /// Write the block record and move tip and height in one transaction.
    ///
    /// The transaction aborts with `TipMoved` unless the persisted tip still
    /// equals `expected_tip` (`None` means no chain exists yet).
    fn commit_block(blocks: &Tree, block: &Block, expected_tip: Option<&str>) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;
        let height = block.get_height().to_string();

        blocks
            .transaction(|tx_db| -> ConflictableTransactionResult<(), LedgerError> {
                let current = tx_db
                    .get(TIP_BLOCK_HASH_KEY)?
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
                if current.as_deref() != expected_tip {
                    return Err(ConflictableTransactionError::Abort(LedgerError::TipMoved {
                        expected: expected_tip.unwrap_or_default().to_string(),
                        found: current.unwrap_or_default(),
                    }));
                }

                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                tx_db.insert(HEIGHT_KEY, height.as_bytes())?;
                Ok(())
            })
            .map_err(|e: TransactionError<LedgerError>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => {
                    LedgerError::StorageIo(format!("Failed to commit block: {err}"))
                }
            })
    }

    /// Append a block holding `transactions` on top of the current tip.
    ///
    /// Appends made through this handle and its clones are serialized; appends
    /// from an unrelated handle are caught by the tip check at commit time.
    pub fn append(&self, transactions: &[Transaction]) -> Result<Block> {
        let _writer = self
            .append_lock
            .lock()
            .map_err(|e| LedgerError::StorageIo(format!("Append lock poisoned: {e}")))?;

        let (tip_hash, height) = self.read_metadata()?;
        let block = Block::new_block(tip_hash.clone(), transactions, height + 1)?;

        Self::commit_block(&self.blocks, &block, Some(&tip_hash))?;
        self.db
            .flush()
            .map_err(|e| LedgerError::StorageIo(format!("Failed to flush database: {e}")))?;
        self.set_tip_hash(block.get_hash());

        info!(
            "Appended block {} at height {} with {} transactions",
            block.get_hash(),
            block.get_height(),
            block.get_transactions().len()
        );

        self.index(&block);
        Ok(block)
    }

    fn index(&self, block: &Block) {
        if let Err(e) = self.indexer.index_block(block) {
            error!("Failed to index block {}: {e}", block.get_hash());
        }
    }

    /// Return the block under the cursor and step the cursor to its parent.
    /// Yields `None` once the walk has passed the genesis block.
    pub fn next(&self) -> Result<Option<Block>> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|e| LedgerError::StorageIo(format!("Cursor lock poisoned: {e}")))?;
        if cursor.is_empty() {
            return Ok(None);
        }

        let block = Self::load_block(&self.blocks, cursor.as_str())?.ok_or_else(|| {
            LedgerError::StorageIo(format!("Block {} referenced by the chain is missing", *cursor))
        })?;
        *cursor = block.get_pre_block_hash().to_string();
        Ok(Some(block))
    }

    /// Move the cursor back to the current tip.
    pub fn reset_cursor(&self) {
        let tip = self.get_tip_hash();
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        *cursor = tip;
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.blocks.clone())
    }

    fn load_block(blocks: &Tree, block_hash: &str) -> Result<Option<Block>> {
        blocks
            .get(block_hash)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to get block: {e}")))?
            .map(|bytes| Block::deserialize(bytes.as_ref()))
            .transpose()
    }

    pub fn get_block(&self, block_hash: &str) -> Result<Option<Block>> {
        Self::load_block(&self.blocks, block_hash)
    }

    pub fn get_db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn get_tip_hash(&self) -> String {
        self.tip_hash
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &str) {
        let mut tip_hash = self.tip_hash.write().unwrap_or_else(|e| e.into_inner());
        *tip_hash = String::from(new_tip_hash)
    }

    pub fn get_tip_block(&self) -> Result<Block> {
        let tip = self.get_tip_hash();
        self.get_block(&tip)?
            .ok_or_else(|| LedgerError::StorageIo(format!("Tip block {tip} is missing")))
    }

    /// Height of the tip, read from the persisted metadata.
    pub fn get_best_height(&self) -> Result<u64> {
        Ok(self.read_metadata()?.1)
    }

    pub fn find_transaction_block(&self, txid: &[u8]) -> Result<Option<Block>> {
        match self.tx_index.find_block_hash(txid)? {
            Some(block_hash) => self.get_block(&block_hash),
            None => Ok(None),
        }
    }

    pub fn get_account(&self, address: &[u8]) -> Result<Option<Account>> {
        self.accounts
            .get(address)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to get account: {e}")))?
            .map(|bytes| Account::deserialize(bytes.as_ref()))
            .transpose()
    }
}

impl AccountSink for Blockchain {
    fn register_account(&self, address: &[u8], account: &Account) -> Result<()> {
        let account_data = account.serialize()?;
        self.accounts
            .insert(address, account_data)
            .map_err(|e| LedgerError::StorageIo(format!("Failed to store account: {e}")))?;
        self.accounts
            .flush()
            .map_err(|e| LedgerError::StorageIo(format!("Failed to flush accounts: {e}")))?;
        Ok(())
    }
}

/// Walks the chain from a starting hash back to genesis.
pub struct BlockchainIterator {
    blocks: Tree,
    current_hash: String,
}

impl BlockchainIterator {
    fn new(tip_hash: String, blocks: Tree) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip_hash,
            blocks,
        }
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        let loaded = Blockchain::load_block(&self.blocks, &self.current_hash);
        match loaded {
            Ok(Some(block)) => {
                self.current_hash = block.get_pre_block_hash().to_string();
                Some(Ok(block))
            }
            Ok(None) => {
                let missing = std::mem::take(&mut self.current_hash);
                Some(Err(LedgerError::StorageIo(format!(
                    "Block {missing} referenced by the chain is missing"
                ))))
            }
            Err(e) => {
                self.current_hash.clear();
                Some(Err(e))
            }
        }
    }
}
