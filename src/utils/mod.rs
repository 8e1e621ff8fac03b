//! Utility functions and helpers
//!
//! Hashing, node identity keys, timestamps and the bincode helpers used by
//! every persisted record and message payload.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, decode_node_keypair, encode_node_keypair, new_node_keypair,
    sha256_digest, sha256_hex,
};

pub use serialization::{deserialize, deserialize_untrusted, serialize, MAX_PAYLOAD_SIZE};
