//! Error handling for the ledger node
//!
//! Every fallible operation in the crate returns [`Result`], with the failure
//! classified into one of the [`LedgerError`] variants below.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Error taxonomy for chain storage, the overlay and message handling
#[derive(Debug, Clone)]
pub enum LedgerError {
    /// No store exists at the requested path
    NotFound(String),
    /// A store already exists at the requested path
    AlreadyExists(String),
    /// Transaction, read or write failure inside the embedded store
    StorageIo(String),
    /// Encoding or decoding of a stored record failed
    Serialization(String),
    /// A bounded network call exceeded its deadline
    NetworkTimeout(String),
    /// Send or ping to a single peer failed
    PeerUnreachable { peer: String, reason: String },
    /// Inbound payload was malformed or of an unregistered kind
    Decode(String),
    /// Inbound payload decoded to a different type than the handler expects
    TypeMismatch { expected: String, found: String },
    /// The tip moved between reading it and committing a new block
    TipMoved { expected: String, found: String },
    /// Block content failed a structural check
    InvalidBlock(String),
    /// Configuration errors
    Config(String),
    /// Key generation or parsing errors
    Crypto(String),
    /// File I/O errors
    Io(String),
}

impl LedgerError {
    /// Decode and type-mismatch failures both reject a single inbound message.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Decode(_) | LedgerError::TypeMismatch { .. }
        )
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::NotFound(path) => write!(f, "No existing chain found at {path}"),
            LedgerError::AlreadyExists(path) => write!(f, "Chain already exists at {path}"),
            LedgerError::StorageIo(msg) => write!(f, "Storage error: {msg}"),
            LedgerError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            LedgerError::NetworkTimeout(msg) => write!(f, "Network timeout: {msg}"),
            LedgerError::PeerUnreachable { peer, reason } => {
                write!(f, "Peer {peer} unreachable: {reason}")
            }
            LedgerError::Decode(msg) => write!(f, "Decode error: {msg}"),
            LedgerError::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {expected}, found {found}")
            }
            LedgerError::TipMoved { expected, found } => {
                write!(f, "Tip moved during append: expected {expected}, found {found}")
            }
            LedgerError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            LedgerError::Config(msg) => write!(f, "Configuration error: {msg}"),
            LedgerError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            LedgerError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::StorageIo(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for LedgerError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LedgerError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_are_classified() {
        assert!(LedgerError::Decode("bad".to_string()).is_decode_error());
        assert!(LedgerError::TypeMismatch {
            expected: "account".to_string(),
            found: "block".to_string(),
        }
        .is_decode_error());
        assert!(!LedgerError::StorageIo("disk".to_string()).is_decode_error());
    }

    #[test]
    fn test_display_includes_peer() {
        let err = LedgerError::PeerUnreachable {
            peer: "127.0.0.1:6091".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Peer 127.0.0.1:6091 unreachable: connection refused"
        );
    }
}
