// Accounts are replicated verbatim between nodes. The core never interprets
// their content; it only stores them by address and forwards them to peers.

use crate::error::Result;
use crate::utils::{current_timestamp, deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Collection-level permissions attached to an account.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Role {
    pub name: String,
    pub collections_write: Vec<String>,
    pub collections_read_override: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Account {
    address: String,
    public_key: String,
    role: Role,
    attributes: BTreeMap<String, String>,
    last_modified: i64,
}

impl Account {
    pub fn new(address: &str, public_key: &str) -> Result<Account> {
        Ok(Account {
            address: address.to_string(),
            public_key: public_key.to_string(),
            role: Role::default(),
            attributes: BTreeMap::new(),
            last_modified: current_timestamp()?,
        })
    }

    pub fn with_role(mut self, role: Role) -> Account {
        self.role = role;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Account {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get_address(&self) -> &str {
        self.address.as_str()
    }

    pub fn get_public_key(&self) -> &str {
        self.public_key.as_str()
    }

    pub fn get_role(&self) -> &Role {
        &self.role
    }

    pub fn get_attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn get_last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Account> {
        deserialize(bytes)
    }
}

/// Local persistence for accounts received from peers or created locally.
pub trait AccountSink: Send + Sync {
    /// Insert or overwrite the account stored under `address`.
    fn register_account(&self, address: &[u8], account: &Account) -> Result<()>;
}
