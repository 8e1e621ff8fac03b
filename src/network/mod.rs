//! Peer-to-peer overlay
//!
//! Nodes run a libp2p swarm: Kademlia keeps the routing table, Noise proves
//! every peer's identity, and a small request/response protocol carries pings
//! and ledger objects. Inbound objects are routed by kind through the
//! [`Dispatcher`].

pub mod behaviour;
pub mod broadcast;
pub mod codec;
pub mod dispatcher;
pub mod overlay;
pub mod peer;

pub use broadcast::Delivery;
pub use codec::{Request, Response, MAX_FRAME_SIZE};
pub use dispatcher::{
    AccountHandler, BlockAnnouncementHandler, Dispatcher, HandlerContext, Message, MessageHandler,
};
pub use overlay::{
    LogEvents, Overlay, OverlayConfig, OverlayEvents, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE,
    DEFAULT_PORT, DEFAULT_TIMEOUT,
};
pub use peer::{parse_address, PeerId, PeerIdentity};
