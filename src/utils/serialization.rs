//! Bincode encoding for stored records and peer payloads
//!
//! Records read back from the local store use the plain standard
//! configuration. Payloads that arrive from peers go through
//! [`deserialize_untrusted`], which caps how much any length prefix may claim.

use crate::error::{LedgerError, Result};
use bincode::config::{self, Config};
use bincode::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Largest payload accepted from a peer, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

fn decode_with<T, C>(bytes: &[u8], config: C) -> std::result::Result<T, DecodeError>
where
    T: bincode::Decode<()>,
    C: Config,
{
    let (value, _) = bincode::decode_from_slice(bytes, config)?;
    Ok(value)
}

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, config::standard())
        .map_err(|e| LedgerError::Serialization(format!("Serialization failed: {e}")))
}

/// Decode a record written by this node.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    decode_with(bytes, config::standard())
        .map_err(|e| LedgerError::Serialization(format!("Deserialization failed: {e}")))
}

/// Decode bytes received from a peer. Oversized input and length prefixes
/// claiming more than [`MAX_PAYLOAD_SIZE`] fail before anything is allocated.
pub fn deserialize_untrusted<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(LedgerError::Decode(format!(
            "Payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit",
            bytes.len()
        )));
    }
    decode_with(bytes, config::standard().with_limit::<MAX_PAYLOAD_SIZE>())
        .map_err(|e| LedgerError::Decode(format!("Malformed payload: {e}")))
}
