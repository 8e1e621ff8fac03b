use ring::digest::{Context, SHA256};

use crate::error::{LedgerError, Result};
use data_encoding::HEXLOWER;
use libp2p::identity::Keypair;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LedgerError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    // Ensure the timestamp fits in i64
    if duration > i64::MAX as u128 {
        return Err(LedgerError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(&sha256_digest(data))
}

/// Generate a fresh Ed25519 node identity.
pub fn new_node_keypair() -> Keypair {
    Keypair::generate_ed25519()
}

/// Encode a node identity for the key file.
pub fn encode_node_keypair(keypair: &Keypair) -> Result<Vec<u8>> {
    keypair
        .to_protobuf_encoding()
        .map_err(|e| LedgerError::Crypto(format!("Failed to encode node key: {e}")))
}

pub fn decode_node_keypair(bytes: &[u8]) -> Result<Keypair> {
    Keypair::from_protobuf_encoding(bytes)
        .map_err(|e| LedgerError::Crypto(format!("Invalid node key: {e}")))
}
