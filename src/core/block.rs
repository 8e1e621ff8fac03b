use crate::core::Transaction;
use crate::error::{LedgerError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    pre_block_hash: String, // Empty for the genesis block
    hash: String,
    transactions: Vec<Transaction>,
    height: u64,
}

impl Block {
    pub fn new_block(
        pre_block_hash: String,
        transactions: &[Transaction],
        height: u64,
    ) -> Result<Block> {
        Self::with_timestamp(current_timestamp()?, pre_block_hash, transactions, height)
    }

    pub fn generate_genesis_block() -> Result<Block> {
        Block::new_block(String::new(), &[Transaction::genesis()], 0)
    }

    fn with_timestamp(
        timestamp: i64,
        pre_block_hash: String,
        transactions: &[Transaction],
        height: u64,
    ) -> Result<Block> {
        if height == 0 && !pre_block_hash.is_empty() {
            return Err(LedgerError::InvalidBlock(
                "Genesis block cannot reference a previous block".to_string(),
            ));
        }
        if height > 0 && pre_block_hash.is_empty() {
            return Err(LedgerError::InvalidBlock(format!(
                "Block at height {height} must reference a previous block"
            )));
        }

        let mut block = Block {
            timestamp,
            pre_block_hash,
            hash: String::new(),
            transactions: transactions.to_vec(),
            height,
        };
        block.hash = block.compute_hash();
        Ok(block)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &str {
        self.pre_block_hash.as_str()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut txhashs = vec![];
        for transaction in &self.transactions {
            txhashs.extend(transaction.get_id());
        }

        sha256_digest(txhashs.as_slice())
    }

    /// Recompute the content hash and compare it with the stored one.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    fn compute_hash(&self) -> String {
        let mut data_bytes = vec![];
        data_bytes.extend(self.pre_block_hash.as_bytes());
        data_bytes.extend(self.hash_transactions());
        data_bytes.extend(self.timestamp.to_be_bytes());
        data_bytes.extend(self.height.to_be_bytes());
        HEXLOWER.encode(sha256_digest(&data_bytes).as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_block_shape() {
        let genesis = Block::generate_genesis_block().unwrap();
        assert_eq!(genesis.get_height(), 0);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_transactions().len(), 1);
        assert_eq!(genesis.get_hash().len(), 64);
        assert!(genesis.verify_hash());
    }

    #[test]
    fn test_block_decode_preserves_links_and_transactions() {
        let txs = vec![
            Transaction::new(b"first".to_vec()),
            Transaction::new(b"second".to_vec()),
        ];
        let block = Block::new_block("ab".repeat(32), &txs, 7).unwrap();

        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();

        assert_eq!(decoded.get_pre_block_hash(), block.get_pre_block_hash());
        assert_eq!(decoded.get_height(), 7);
        assert_eq!(decoded.get_transactions(), txs.as_slice());
        assert!(decoded.verify_hash());
    }

    #[test]
    fn test_hash_covers_height() {
        let a = Block::with_timestamp(1, "cd".repeat(32), &[], 1).unwrap();
        let b = Block::with_timestamp(1, "cd".repeat(32), &[], 2).unwrap();
        assert_ne!(a.get_hash(), b.get_hash());

        let mut tampered = a.clone();
        tampered.height = 5;
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn test_link_rules_enforced() {
        assert!(matches!(
            Block::new_block(String::new(), &[], 3),
            Err(LedgerError::InvalidBlock(_))
        ));
        assert!(matches!(
            Block::new_block("ef".repeat(32), &[], 0),
            Err(LedgerError::InvalidBlock(_))
        ));
    }
}
