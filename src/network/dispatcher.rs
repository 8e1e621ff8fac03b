//! Typed message registry and inbound routing
//!
//! Message types are registered with a decoder under their `KIND`; handlers
//! are registered per kind. An inbound message is decoded lazily by the
//! handler through its [`HandlerContext`].

use crate::core::{Account, AccountSink, Block};
use crate::error::{LedgerError, Result};
use crate::network::peer::PeerIdentity;
use crate::utils::deserialize_untrusted;
use log::{debug, info};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// An object that can travel between peers as an opaque payload.
pub trait Message: Sized + Send + 'static {
    const KIND: &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

impl Message for Account {
    const KIND: &'static str = "account";

    fn to_bytes(&self) -> Result<Vec<u8>> {
        self.serialize()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        deserialize_untrusted(bytes)
    }
}

impl Message for Block {
    const KIND: &'static str = "block";

    fn to_bytes(&self) -> Result<Vec<u8>> {
        self.serialize()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        deserialize_untrusted(bytes)
    }
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>>;

fn decode_boxed<M: Message>(bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
    let message = M::from_bytes(bytes)
        .map_err(|e| LedgerError::Decode(format!("Malformed {} payload: {e}", M::KIND)))?;
    Ok(Box::new(message))
}

/// Everything a handler needs to know about one inbound message.
pub struct HandlerContext<'a> {
    sender: PeerIdentity,
    kind: String,
    payload: Vec<u8>,
    is_request: bool,
    decoders: &'a HashMap<&'static str, DecodeFn>,
}

impl<'a> HandlerContext<'a> {
    pub fn sender(&self) -> &PeerIdentity {
        &self.sender
    }

    pub fn kind(&self) -> &str {
        self.kind.as_str()
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// True when the sender waits for a reply on this message.
    pub fn is_request(&self) -> bool {
        self.is_request
    }

    /// Decode the payload with the decoder registered for its kind.
    pub fn decode_message(&self) -> Result<Box<dyn Any + Send>> {
        let decode = self.decoders.get(self.kind.as_str()).ok_or_else(|| {
            LedgerError::Decode(format!("No message type registered for {}", self.kind))
        })?;
        decode(&self.payload)
    }

    /// Decode the payload and require it to be an `M`.
    pub fn decode<M: Message>(&self) -> Result<M> {
        self.decode_message()?
            .downcast::<M>()
            .map(|message| *message)
            .map_err(|_| LedgerError::TypeMismatch {
                expected: M::KIND.to_string(),
                found: self.kind.clone(),
            })
    }
}

pub trait MessageHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<()>;
}

#[derive(Default)]
pub struct Dispatcher {
    decoders: HashMap<&'static str, DecodeFn>,
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Dispatcher wired for ledger replication: accounts are persisted through
    /// `sink`, block announcements are logged.
    pub fn for_ledger(sink: Arc<dyn AccountSink>) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_message::<Account>();
        dispatcher.register_message::<Block>();
        dispatcher.register_handler(Account::KIND, Arc::new(AccountHandler::new(sink)));
        dispatcher.register_handler(Block::KIND, Arc::new(BlockAnnouncementHandler));
        dispatcher
    }

    pub fn register_message<M: Message>(&mut self) {
        self.decoders.insert(M::KIND, decode_boxed::<M> as DecodeFn);
    }

    pub fn register_handler(&mut self, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(kind.to_string()).or_default().push(handler);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn context(
        &self,
        sender: PeerIdentity,
        kind: &str,
        payload: Vec<u8>,
        is_request: bool,
    ) -> HandlerContext<'_> {
        HandlerContext {
            sender,
            kind: kind.to_string(),
            payload,
            is_request,
            decoders: &self.decoders,
        }
    }

    /// Route one inbound message to every handler registered for its kind.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>) -> Result<()> {
        if !self.is_registered(ctx.kind()) {
            return Err(LedgerError::Decode(format!(
                "Unregistered message kind {} from {}",
                ctx.kind(),
                ctx.sender()
            )));
        }

        match self.handlers.get(ctx.kind()) {
            Some(handlers) => {
                for handler in handlers {
                    handler.handle(ctx)?;
                }
            }
            None => debug!("No handler for {} message from {}", ctx.kind(), ctx.sender()),
        }
        Ok(())
    }
}

/// Persists accounts replicated from peers.
pub struct AccountHandler {
    sink: Arc<dyn AccountSink>,
}

impl AccountHandler {
    pub fn new(sink: Arc<dyn AccountSink>) -> AccountHandler {
        AccountHandler { sink }
    }
}

impl MessageHandler for AccountHandler {
    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<()> {
        if ctx.is_request() {
            return Ok(());
        }

        let account = ctx.decode::<Account>()?;
        self.sink
            .register_account(account.get_address().as_bytes(), &account)?;

        info!("{}> {:?}", ctx.sender(), account);
        Ok(())
    }
}

/// Logs blocks announced by peers. Adopting them is a fork-choice decision
/// this node does not make.
pub struct BlockAnnouncementHandler;

impl MessageHandler for BlockAnnouncementHandler {
    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<()> {
        if ctx.is_request() {
            return Ok(());
        }

        let block = ctx.decode::<Block>()?;
        if !block.verify_hash() {
            return Err(LedgerError::InvalidBlock(format!(
                "{} announced block {} whose contents do not match its hash",
                ctx.sender(),
                block.get_hash()
            )));
        }
        info!(
            "{} announced block {} at height {}",
            ctx.sender(),
            block.get_hash(),
            block.get_height()
        );
        Ok(())
    }
}
