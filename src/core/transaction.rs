// Transactions are opaque to the ledger core: an identifier plus whatever bytes
// the caller wants recorded. Validation and semantics live outside this crate.

use crate::error::Result;
use crate::utils::{deserialize, serialize, sha256_digest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const GENESIS_PAYLOAD: &[u8] = b"genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,      // SHA-256 over a random nonce and the payload
    payload: Vec<u8>, // Opaque content supplied by the caller
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Transaction {
        // The nonce keeps two transactions with identical payloads distinct
        let mut preimage = Uuid::new_v4().as_bytes().to_vec();
        preimage.extend_from_slice(&payload);
        Transaction {
            id: sha256_digest(&preimage),
            payload,
        }
    }

    /// The transaction carried by every genesis block.
    pub fn genesis() -> Transaction {
        Transaction {
            id: sha256_digest(GENESIS_PAYLOAD),
            payload: GENESIS_PAYLOAD.to_vec(),
        }
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}
