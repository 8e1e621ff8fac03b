//! Combined libp2p behaviour of an overlay node
//!
//! - Kademlia keeps the routing table and answers closest-peer lookups
//! - Identify tells each side which addresses the other listens on
//! - Request/response carries pings and ledger messages

use crate::network::codec::{LedgerCodec, Request, Response, PROTOCOL_NAME};
use crate::network::overlay::OverlayConfig;
use libp2p::identify::{self, Behaviour as Identify, Event as IdentifyEvent};
use libp2p::kad::{self, store::MemoryStore, Behaviour as Kademlia, Event as KademliaEvent};
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identity, StreamProtocol};
use std::iter;
use std::num::NonZeroUsize;

pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ledger/kad/1.0.0");
pub const IDENTIFY_PROTOCOL: &str = "/ledger/id/1.0.0";

pub type RpcEvent = request_response::Event<Request, Response>;

#[derive(Debug)]
pub enum LedgerBehaviourEvent {
    Kademlia(KademliaEvent),
    Identify(IdentifyEvent),
    Rpc(RpcEvent),
}

impl From<KademliaEvent> for LedgerBehaviourEvent {
    fn from(event: KademliaEvent) -> Self {
        LedgerBehaviourEvent::Kademlia(event)
    }
}

impl From<IdentifyEvent> for LedgerBehaviourEvent {
    fn from(event: IdentifyEvent) -> Self {
        LedgerBehaviourEvent::Identify(event)
    }
}

impl From<RpcEvent> for LedgerBehaviourEvent {
    fn from(event: RpcEvent) -> Self {
        LedgerBehaviourEvent::Rpc(event)
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "LedgerBehaviourEvent")]
pub struct LedgerBehaviour {
    pub kademlia: Kademlia<MemoryStore>,
    pub identify: Identify,
    pub rpc: request_response::Behaviour<LedgerCodec>,
}

impl LedgerBehaviour {
    pub fn new(keypair: &identity::Keypair, config: &OverlayConfig) -> LedgerBehaviour {
        let local_peer_id = keypair.public().to_peer_id();

        let mut kademlia_config = kad::Config::new(KAD_PROTOCOL);
        kademlia_config
            .set_query_timeout(config.timeout * 2)
            .set_replication_factor(non_zero(config.bucket_size))
            .set_parallelism(non_zero(config.alpha));
        let store = MemoryStore::new(local_peer_id);
        let mut kademlia = Kademlia::with_config(local_peer_id, store, kademlia_config);
        // Answer lookups even before any address is confirmed as external
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = Identify::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("ledger-node/{}", env!("CARGO_PKG_VERSION")))
                .with_push_listen_addr_updates(true),
        );

        let rpc = request_response::Behaviour::with_codec(
            LedgerCodec,
            iter::once((PROTOCOL_NAME, ProtocolSupport::Full)),
            request_response::Config::default().with_request_timeout(config.timeout),
        );

        LedgerBehaviour {
            kademlia,
            identify,
            rpc,
        }
    }
}

fn non_zero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}
