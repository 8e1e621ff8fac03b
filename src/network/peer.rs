use crate::error::{LedgerError, Result};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub use libp2p::PeerId;

/// Dialable address plus the overlay identifier proven by the Noise
/// handshake on that address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub address: Multiaddr,
    pub id: PeerId,
}

impl PeerIdentity {
    pub fn new(address: Multiaddr, id: PeerId) -> PeerIdentity {
        PeerIdentity { address, id }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.address, self.id)
    }
}

/// TCP multiaddr for a socket address.
pub fn socket_multiaddr(ip: IpAddr, port: u16) -> Multiaddr {
    Multiaddr::empty().with(Protocol::from(ip)).with(Protocol::Tcp(port))
}

/// Accept `ip:port`, `hostname:port` or a multiaddr such as
/// `/ip4/10.0.0.1/tcp/6091`.
pub fn parse_address(text: &str) -> Result<Multiaddr> {
    let text = text.trim();
    let invalid =
        |reason: String| LedgerError::Config(format!("Invalid peer address {text}: {reason}"));

    if text.starts_with('/') {
        return text.parse().map_err(|e| invalid(format!("{e}")));
    }
    if let Ok(socket) = text.parse::<SocketAddr>() {
        return Ok(socket_multiaddr(socket.ip(), socket.port()));
    }

    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port".to_string()))?;
    let port: u16 = port.parse().map_err(|e| invalid(format!("{e}")))?;
    if host.is_empty() || host.contains(':') {
        return Err(invalid("expected host:port".to_string()));
    }
    Ok(Multiaddr::empty()
        .with(Protocol::Dns(host.to_string().into()))
        .with(Protocol::Tcp(port)))
}

/// TCP port of a multiaddr, if it has one.
pub fn tcp_port(address: &Multiaddr) -> Option<u16> {
    address.iter().find_map(|protocol| match protocol {
        Protocol::Tcp(port) => Some(port),
        _ => None,
    })
}
