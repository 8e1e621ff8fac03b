use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// `key=value` pair given to `--attr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeArg {
    pub key: String,
    pub value: String,
}

impl FromStr for AttributeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(AttributeArg {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            }),
            _ => Err(format!("Invalid attribute: {s}. Expected key=value")),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "ledger-node")]
pub struct Opt {
    #[arg(long = "config", global = true, help = "TOML settings file")]
    pub config: Option<PathBuf>,
    #[arg(
        long = "data-dir",
        global = true,
        help = "Directory holding the chain store and node key"
    )]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createchain", about = "Create a new chain holding only genesis")]
    Createchain,
    #[command(name = "printchain", about = "Print all blocks from tip to genesis")]
    Printchain,
    #[command(name = "append", about = "Append one block carrying the given payloads")]
    Append {
        #[arg(help = "Transaction payloads (UTF-8)")]
        payloads: Vec<String>,
    },
    #[command(name = "registeraccount", about = "Store an account locally")]
    RegisterAccount {
        #[arg(help = "Account address")]
        address: String,
        #[arg(help = "Account public key")]
        public_key: String,
        #[arg(long = "attr", help = "Account attribute as key=value")]
        attributes: Vec<AttributeArg>,
    },
    #[command(name = "startnode", about = "Join the overlay and serve peers")]
    StartNode {
        #[arg(long = "seed", help = "Bootstrap peer address (host:port)")]
        seeds: Vec<String>,
    },
    #[command(
        name = "announceaccount",
        about = "Broadcast a stored account to the overlay and exit"
    )]
    AnnounceAccount {
        #[arg(help = "Address of a locally stored account")]
        address: String,
        #[arg(long = "seed", help = "Bootstrap peer address (host:port)")]
        seeds: Vec<String>,
    },
    #[command(
        name = "announceblock",
        about = "Broadcast a stored block (the tip by default) to the overlay and exit"
    )]
    AnnounceBlock {
        #[arg(long = "hash", help = "Hash of the block to announce")]
        hash: Option<String>,
        #[arg(long = "seed", help = "Bootstrap peer address (host:port)")]
        seeds: Vec<String>,
    },
}
