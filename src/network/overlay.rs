use crate::error::{LedgerError, Result};
use crate::network::behaviour::{LedgerBehaviour, LedgerBehaviourEvent, RpcEvent};
use crate::network::codec::{Request, Response};
use crate::network::dispatcher::Dispatcher;
use crate::network::peer::{parse_address, socket_multiaddr, tcp_port, PeerId, PeerIdentity};
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::kad::{self, QueryId, QueryResult};
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, Swarm, SwarmBuilder};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const DEFAULT_PORT: u16 = 6091;
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_BUCKET_SIZE: usize = 20;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub bind_host: IpAddr,
    pub bind_port: u16,
    /// Address peers should dial; derived from the bound socket when unset
    pub advertise_address: Option<String>,
    pub timeout: Duration,
    /// Peers returned per closest-peer lookup
    pub bucket_size: usize,
    /// Parallel queries per discovery step
    pub alpha: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            advertise_address: None,
            timeout: DEFAULT_TIMEOUT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
        }
    }
}

/// Observer for routing-table membership changes.
pub trait OverlayEvents: Send + Sync {
    fn on_peer_admitted(&self, peer: &PeerIdentity);
    fn on_peer_evicted(&self, peer: &PeerId);
}

pub struct LogEvents;

impl OverlayEvents for LogEvents {
    fn on_peer_admitted(&self, peer: &PeerIdentity) {
        info!("Learned about a new peer {peer}.");
    }

    fn on_peer_evicted(&self, peer: &PeerId) {
        info!("Forgotten a peer {peer}.");
    }
}

type Reply<T> = std_mpsc::SyncSender<T>;

enum Command {
    Peers {
        reply: Reply<Vec<PeerIdentity>>,
    },
    Discover {
        reply: Reply<Vec<PeerIdentity>>,
    },
    Ping {
        address: Multiaddr,
        expected: Option<PeerId>,
        reply: Reply<Result<PeerIdentity>>,
    },
    Send {
        peer: PeerId,
        request: Request,
        reply: Reply<Result<()>>,
    },
    IsConnected {
        peer: PeerId,
        reply: Reply<bool>,
    },
    #[cfg(test)]
    AddAddress {
        peer: PeerId,
        address: Multiaddr,
    },
    Shutdown,
}

fn respond<T>(reply: Reply<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("Caller stopped waiting for an overlay reply");
    }
}

struct PendingPing {
    address: Multiaddr,
    reply: Reply<Result<PeerIdentity>>,
}

enum PendingRequest {
    Ping { peer: PeerId, pending: PendingPing },
    Deliver(Reply<Result<()>>),
}

struct Discovery {
    found: Vec<PeerIdentity>,
    reply: Reply<Vec<PeerIdentity>>,
}

/// Owns the swarm; everything else talks to it through `Command`s.
struct EventLoop {
    swarm: Swarm<LedgerBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<dyn OverlayEvents>,
    addresses: HashMap<PeerId, Multiaddr>,
    pending_dials: HashMap<ConnectionId, PendingPing>,
    pending_requests: HashMap<OutboundRequestId, PendingRequest>,
    discoveries: HashMap<QueryId, Discovery>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        info!("Overlay event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Peers { reply } => respond(reply, self.peers()),
            Command::Discover { reply } => {
                let local = *self.swarm.local_peer_id();
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(local);
                self.discoveries.insert(
                    query_id,
                    Discovery {
                        found: vec![],
                        reply,
                    },
                );
            }
            Command::Ping {
                address,
                expected,
                reply,
            } => {
                let opts = match expected {
                    Some(peer) => DialOpts::peer_id(peer)
                        .addresses(vec![address.clone()])
                        .condition(PeerCondition::Always)
                        .build(),
                    None => DialOpts::unknown_peer_id().address(address.clone()).build(),
                };
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials
                            .insert(connection_id, PendingPing { address, reply });
                    }
                    Err(e) => respond(
                        reply,
                        Err(LedgerError::PeerUnreachable {
                            peer: address.to_string(),
                            reason: e.to_string(),
                        }),
                    ),
                }
            }
            Command::Send {
                peer,
                request,
                reply,
            } => {
                let request_id = self.swarm.behaviour_mut().rpc.send_request(&peer, request);
                self.pending_requests
                    .insert(request_id, PendingRequest::Deliver(reply));
            }
            Command::IsConnected { peer, reply } => respond(reply, self.swarm.is_connected(&peer)),
            #[cfg(test)]
            Command::AddAddress { peer, address } => {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, address);
            }
            Command::Shutdown => {}
        }
    }

    fn peers(&mut self) -> Vec<PeerIdentity> {
        let mut peers = Vec::new();
        for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
            for entry in bucket.iter() {
                peers.push(PeerIdentity::new(
                    entry.node.value.first().clone(),
                    *entry.node.key.preimage(),
                ));
            }
        }
        peers
    }

    fn identity_of(&self, peer: PeerId) -> PeerIdentity {
        let address = self.addresses.get(&peer).cloned().unwrap_or_else(Multiaddr::empty);
        PeerIdentity::new(address, peer)
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<LedgerBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(LedgerBehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event)
            }
            SwarmEvent::Behaviour(LedgerBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event)
            }
            SwarmEvent::Behaviour(LedgerBehaviourEvent::Rpc(event)) => self.handle_rpc_event(event),
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!("Connected to {peer_id} at {}", endpoint.get_remote_address());
                self.addresses
                    .entry(peer_id)
                    .or_insert_with(|| endpoint.get_remote_address().clone());
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let request_id = self
                        .swarm
                        .behaviour_mut()
                        .rpc
                        .send_request(&peer_id, Request::Ping);
                    self.pending_requests.insert(
                        request_id,
                        PendingRequest::Ping {
                            peer: peer_id,
                            pending,
                        },
                    );
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection to {peer_id} closed: {cause:?}");
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                error,
                ..
            } => {
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    respond(
                        pending.reply,
                        Err(LedgerError::PeerUnreachable {
                            peer: pending.address.to_string(),
                            reason: error.to_string(),
                        }),
                    );
                }
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                debug!("Inbound connection failed: {error}");
            }
            _ => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer,
                is_new_peer,
                addresses,
                old_peer,
                ..
            } => {
                let address = addresses.first().clone();
                self.addresses.insert(peer, address.clone());
                if is_new_peer {
                    let identity = PeerIdentity::new(address, peer);
                    self.events.on_peer_admitted(&identity);
                    for discovery in self.discoveries.values_mut() {
                        discovery.found.push(identity.clone());
                    }
                }
                if let Some(evicted) = old_peer {
                    self.events.on_peer_evicted(&evicted);
                }
            }
            kad::Event::OutboundQueryProgressed {
                id,
                result: QueryResult::GetClosestPeers(result),
                step,
                ..
            } => {
                if let Err(e) = result {
                    debug!("Closest-peer lookup ended early: {e}");
                }
                if step.last {
                    if let Some(discovery) = self.discoveries.remove(&id) {
                        respond(discovery.reply, discovery.found);
                    }
                }
            }
            other => debug!("Kademlia event: {other:?}"),
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            debug!("{peer_id} listens on {:?}", info.listen_addrs);
            for address in info.listen_addrs {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, address);
            }
        }
    }

    fn handle_rpc_event(&mut self, event: RpcEvent) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.handle_request(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => self.handle_response(peer, request_id, response),
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                let failure = match error {
                    OutboundFailure::Timeout => {
                        LedgerError::NetworkTimeout(format!("No response from {peer}"))
                    }
                    other => LedgerError::PeerUnreachable {
                        peer: self.identity_of(peer).to_string(),
                        reason: other.to_string(),
                    },
                };
                match self.pending_requests.remove(&request_id) {
                    Some(PendingRequest::Ping { pending, .. }) => {
                        respond(pending.reply, Err(failure))
                    }
                    Some(PendingRequest::Deliver(reply)) => respond(reply, Err(failure)),
                    None => debug!("Untracked request to {peer} failed: {failure}"),
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound request from {peer} failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_request(&mut self, peer: PeerId, request: Request, channel: ResponseChannel<Response>) {
        let (kind, payload, expects_reply) = match request {
            Request::Ping => return self.send_response(peer, channel, Response::Pong),
            Request::Message {
                kind,
                payload,
                expects_reply,
            } => (kind, payload, expects_reply),
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let ctx = dispatcher.context(self.identity_of(peer), &kind, payload, expects_reply);
        match dispatcher.dispatch(&ctx) {
            Ok(()) => self.send_response(peer, channel, Response::Ack),
            // Malformed input poisons the connection
            Err(e) if e.is_decode_error() => {
                warn!("Dropping connection to {}: {e}", ctx.sender());
                drop(channel);
                if self.swarm.disconnect_peer_id(peer).is_err() {
                    debug!("{peer} was already disconnected");
                }
            }
            Err(e) => {
                error!("Failed to handle {kind} message from {}: {e}", ctx.sender());
                self.send_response(peer, channel, Response::Ack);
            }
        }
    }

    fn send_response(&mut self, peer: PeerId, channel: ResponseChannel<Response>, response: Response) {
        if self
            .swarm
            .behaviour_mut()
            .rpc
            .send_response(channel, response)
            .is_err()
        {
            debug!("{peer} stopped waiting for our response");
        }
    }

    fn handle_response(&mut self, peer: PeerId, request_id: OutboundRequestId, response: Response) {
        match (self.pending_requests.remove(&request_id), response) {
            (Some(PendingRequest::Ping { peer, pending }), Response::Pong) => {
                // The Noise handshake proved `peer` owns this address
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, pending.address.clone());
                respond(pending.reply, Ok(PeerIdentity::new(pending.address, peer)));
            }
            (Some(PendingRequest::Deliver(reply)), Response::Ack) => respond(reply, Ok(())),
            (Some(PendingRequest::Ping { pending, .. }), other) => respond(
                pending.reply,
                Err(LedgerError::Decode(format!(
                    "Unexpected reply to ping from {peer}: {other:?}"
                ))),
            ),
            (Some(PendingRequest::Deliver(reply)), other) => respond(
                reply,
                Err(LedgerError::Decode(format!(
                    "Unexpected reply to message from {peer}: {other:?}"
                ))),
            ),
            (None, other) => debug!("Ignoring unsolicited {other:?} from {peer}"),
        }
    }
}

fn build_swarm(keypair: Keypair, config: &OverlayConfig) -> Result<Swarm<LedgerBehaviour>> {
    let behaviour_config = config.clone();
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| LedgerError::Io(format!("Failed to set up transport: {e}")))?
        .with_dns()
        .map_err(|e| LedgerError::Io(format!("Failed to set up DNS resolution: {e}")))?
        .with_behaviour(|key| LedgerBehaviour::new(key, &behaviour_config))
        .map_err(|e| LedgerError::Io(format!("Failed to set up behaviour: {e}")))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();
    Ok(swarm)
}

/// Bind the swarm and wait for the first listen address.
async fn listen(swarm: &mut Swarm<LedgerBehaviour>, config: &OverlayConfig) -> Result<Multiaddr> {
    let bind = socket_multiaddr(config.bind_host, config.bind_port);
    swarm.listen_on(bind.clone()).map_err(|e| {
        LedgerError::Io(format!("Failed to bind to {bind}: {e}"))
    })?;

    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
            SwarmEvent::ListenerError { error, .. } => {
                return Err(LedgerError::Io(format!("Failed to bind to {bind}: {error}")))
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                return Err(LedgerError::Io(format!("Listener on {bind} closed: {reason:?}")))
            }
            _ => {}
        }
    }
}

fn advertised_address(config: &OverlayConfig, listen_address: &Multiaddr) -> Result<Multiaddr> {
    if let Some(address) = &config.advertise_address {
        return parse_address(address);
    }
    let port = tcp_port(listen_address).ok_or_else(|| {
        LedgerError::Io(format!("Listen address {listen_address} has no TCP port"))
    })?;
    let host = if config.bind_host.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        config.bind_host
    };
    Ok(socket_multiaddr(host, port))
}

struct Started {
    identity: PeerIdentity,
    listen_address: Multiaddr,
}

async fn start_swarm(
    keypair: Keypair,
    config: &OverlayConfig,
) -> Result<(Swarm<LedgerBehaviour>, Started)> {
    let local_peer_id = keypair.public().to_peer_id();
    let mut swarm = build_swarm(keypair, config)?;
    let listen_address = listen(&mut swarm, config).await?;
    let advertised = advertised_address(config, &listen_address)?;
    swarm.add_external_address(advertised.clone());
    Ok((
        swarm,
        Started {
            identity: PeerIdentity::new(advertised, local_peer_id),
            listen_address,
        },
    ))
}

/// A running overlay node: a libp2p swarm driven on its own thread.
pub struct Overlay {
    identity: PeerIdentity,
    listen_address: Multiaddr,
    timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Overlay {
    /// Bind, start serving, then bootstrap from `seeds` (if any).
    pub fn start(
        config: OverlayConfig,
        keypair: Keypair,
        dispatcher: Arc<Dispatcher>,
        seeds: &[String],
    ) -> Result<Overlay> {
        Self::start_with_events(config, keypair, dispatcher, Arc::new(LogEvents), seeds)
    }

    pub fn start_with_events(
        config: OverlayConfig,
        keypair: Keypair,
        dispatcher: Arc<Dispatcher>,
        events: Arc<dyn OverlayEvents>,
        seeds: &[String],
    ) -> Result<Overlay> {
        let local_peer_id = keypair.public().to_peer_id();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Started>>(1);
        let worker_config = config.clone();

        let worker = thread::Builder::new()
            .name(format!("overlay-{local_peer_id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        respond(ready_tx, Err(LedgerError::Io(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let swarm = match start_swarm(keypair, &worker_config).await {
                        Ok((swarm, started)) => {
                            respond(ready_tx, Ok(started));
                            swarm
                        }
                        Err(e) => {
                            respond(ready_tx, Err(e));
                            return;
                        }
                    };

                    EventLoop {
                        swarm,
                        commands: command_rx,
                        dispatcher,
                        events,
                        addresses: HashMap::new(),
                        pending_dials: HashMap::new(),
                        pending_requests: HashMap::new(),
                        discoveries: HashMap::new(),
                    }
                    .run()
                    .await;
                });
            })?;

        let started = ready_rx
            .recv()
            .map_err(|_| LedgerError::Io("Overlay worker exited during startup".to_string()))??;
        info!(
            "Overlay listening on {} as {}",
            started.listen_address, started.identity
        );

        let overlay = Overlay {
            identity: started.identity,
            listen_address: started.listen_address,
            timeout: config.timeout,
            commands: command_tx,
            worker: Mutex::new(Some(worker)),
        };

        if seeds.is_empty() {
            info!("no peer address(es) provided, starting without trying to discover");
        } else {
            overlay.bootstrap(seeds);
            overlay.discover();
        }

        Ok(overlay)
    }

    /// Ping every seed; unreachable seeds are logged and skipped.
    fn bootstrap(&self, seeds: &[String]) {
        for addr in seeds {
            match self.ping(addr) {
                Ok(peer) => info!("Bootstrapped from {peer}"),
                Err(e) => warn!("failed to ping bootstrap node ({addr}). [{e}]"),
            }
        }
    }

    fn submit<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<std_mpsc::Receiver<T>> {
        let (reply, receiver) = std_mpsc::sync_channel(1);
        self.commands
            .send(command(reply))
            .map_err(|_| LedgerError::Io("Overlay is shut down".to_string()))?;
        Ok(receiver)
    }

    fn await_reply<T>(receiver: &std_mpsc::Receiver<T>, wait: Duration, what: &str) -> Result<T> {
        receiver.recv_timeout(wait).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                LedgerError::NetworkTimeout(format!("{what} took longer than {wait:?}"))
            }
            RecvTimeoutError::Disconnected => {
                LedgerError::Io(format!("Overlay stopped before {what} finished"))
            }
        })
    }

    fn call<T>(&self, wait: Duration, what: &str, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let receiver = self.submit(command)?;
        Self::await_reply(&receiver, wait, what)
    }

    /// Dial plus round trip.
    fn ping_window(&self) -> Duration {
        self.timeout * 2
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn listen_address(&self) -> &Multiaddr {
        &self.listen_address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Snapshot of the peers currently in the routing table.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.call(self.timeout, "listing peers", |reply| Command::Peers { reply })
            .unwrap_or_else(|e| {
                error!("Failed to list peers: {e}");
                vec![]
            })
    }

    /// Bounded liveness check of whoever answers at `addr`; a responsive peer
    /// is admitted under the identity it proved during the handshake.
    pub fn ping(&self, addr: &str) -> Result<PeerIdentity> {
        let address = parse_address(addr)?;
        self.call(self.ping_window(), "ping", |reply| Command::Ping {
            address,
            expected: None,
            reply,
        })?
    }

    /// Like [`Overlay::ping`], but fails unless the node at `peer.address`
    /// holds the key behind `peer.id`.
    pub fn ping_peer(&self, peer: &PeerIdentity) -> Result<PeerIdentity> {
        let address = peer.address.clone();
        let expected = Some(peer.id);
        self.call(self.ping_window(), "ping", |reply| Command::Ping {
            address,
            expected,
            reply,
        })?
    }

    /// Run one closest-peer lookup of our own id and return the peers it admitted.
    pub fn discover(&self) -> Vec<PeerIdentity> {
        let discovered = self
            .call(self.timeout * 3, "discovery", |reply| Command::Discover { reply })
            .unwrap_or_else(|e| {
                warn!("Discovery failed: {e}");
                vec![]
            });

        if discovered.is_empty() {
            warn!("did not discover any peers.");
        } else {
            let names: Vec<String> = discovered.iter().map(ToString::to_string).collect();
            info!(
                "discovered {} peer(s): [{}]",
                discovered.len(),
                names.join(", ")
            );
        }
        discovered
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        let peer = *peer;
        self.call(self.timeout, "connection check", |reply| Command::IsConnected {
            peer,
            reply,
        })
        .unwrap_or(false)
    }

    /// Send one message to each peer at once and collect the outcomes in
    /// `peers` order. Every peer gets the same deadline.
    pub(crate) fn send_to_all(
        &self,
        peers: &[PeerIdentity],
        kind: &str,
        payload: &[u8],
    ) -> Vec<Result<()>> {
        let receivers: Vec<Result<std_mpsc::Receiver<Result<()>>>> = peers
            .iter()
            .map(|peer| {
                let request = Request::Message {
                    kind: kind.to_string(),
                    payload: payload.to_vec(),
                    expects_reply: false,
                };
                self.submit(|reply| Command::Send {
                    peer: peer.id,
                    request,
                    reply,
                })
            })
            .collect();

        let deadline = Instant::now() + self.ping_window();
        receivers
            .into_iter()
            .map(|receiver| {
                let wait = deadline.saturating_duration_since(Instant::now());
                Self::await_reply(&receiver?, wait, "delivery")?
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn add_peer_address(&self, peer: PeerId, address: Multiaddr) {
        if self
            .commands
            .send(Command::AddAddress { peer, address })
            .is_err()
        {
            error!("Overlay is shut down");
        }
    }

    /// Stop the event loop and wait for the worker thread to exit.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if self.commands.send(Command::Shutdown).is_err() {
                debug!("Overlay event loop already stopped");
            }
            if handle.join().is_err() {
                error!("Overlay worker thread panicked");
            }
        }
    }

    /// Block until the event loop exits.
    pub fn wait(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Overlay worker thread panicked");
            }
        }
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Account;
    use crate::network::dispatcher::{HandlerContext, Message, MessageHandler};
    use crate::testnet::{closed_port_address, start_test_overlay, wait_until, RecordingSink};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingEvents {
        admitted: StdMutex<Vec<PeerIdentity>>,
    }

    impl OverlayEvents for RecordingEvents {
        fn on_peer_admitted(&self, peer: &PeerIdentity) {
            self.admitted.lock().unwrap().push(peer.clone());
        }

        fn on_peer_evicted(&self, _peer: &PeerId) {}
    }

    /// Remembers who sent each account.
    #[derive(Default)]
    struct SenderLog {
        senders: StdMutex<Vec<PeerId>>,
    }

    impl MessageHandler for SenderLog {
        fn handle(&self, ctx: &HandlerContext<'_>) -> crate::Result<()> {
            ctx.decode::<Account>()?;
            self.senders.lock().unwrap().push(ctx.sender().id);
            Ok(())
        }
    }

    struct BrokenStore;

    impl MessageHandler for BrokenStore {
        fn handle(&self, _ctx: &HandlerContext<'_>) -> crate::Result<()> {
            Err(LedgerError::StorageIo("disk full".to_string()))
        }
    }

    fn send_one(from: &Overlay, to: &Overlay, kind: &str, payload: &[u8]) -> Result<()> {
        from.send_to_all(&[to.identity().clone()], kind, payload).remove(0)
    }

    fn seed_of(overlay: &Overlay) -> Vec<String> {
        vec![overlay.identity().address.to_string()]
    }

    #[test]
    fn test_start_without_seeds_is_isolated() {
        let overlay = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        assert!(overlay.peers().is_empty());
        assert!(overlay.discover().is_empty());
        assert_eq!(&overlay.identity().address, overlay.listen_address());
    }

    #[test]
    fn test_advertised_address_overrides_bound_socket() {
        let config = OverlayConfig {
            advertise_address: Some("10.1.2.3:7000".to_string()),
            ..crate::testnet::local_overlay_config()
        };
        let overlay = Overlay::start(
            config,
            crate::utils::new_node_keypair(),
            Arc::new(Dispatcher::new()),
            &[],
        )
        .unwrap();
        assert_eq!(
            overlay.identity().address.to_string(),
            "/ip4/10.1.2.3/tcp/7000"
        );
    }

    #[test]
    fn test_ping_admits_both_sides() {
        let a = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let b = start_test_overlay(Dispatcher::new(), &[]).unwrap();

        let answered = b.ping(&a.identity().address.to_string()).unwrap();

        assert_eq!(&answered, a.identity());
        assert_eq!(b.peers(), vec![a.identity().clone()]);
        assert!(wait_until(Duration::from_secs(5), || a
            .peers()
            .iter()
            .any(|peer| peer.id == b.identity().id)));
    }

    #[test]
    fn test_admission_is_reported() {
        let events = Arc::new(RecordingEvents::default());
        let target = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let observer = Overlay::start_with_events(
            crate::testnet::local_overlay_config(),
            crate::utils::new_node_keypair(),
            Arc::new(Dispatcher::new()),
            events.clone(),
            &seed_of(&target),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || !events
            .admitted
            .lock()
            .unwrap()
            .is_empty()));
        assert_eq!(events.admitted.lock().unwrap()[0].id, target.identity().id);
        drop(observer);
    }

    #[test]
    fn test_unreachable_seed_is_skipped() {
        let overlay = start_test_overlay(Dispatcher::new(), &[closed_port_address()]).unwrap();
        assert!(overlay.peers().is_empty());
    }

    #[test]
    fn test_discovery_learns_peers_of_seed() {
        let hub = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let first = start_test_overlay(Dispatcher::new(), &seed_of(&hub)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || hub.peers().len() == 1));

        let second = start_test_overlay(Dispatcher::new(), &seed_of(&hub)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let known: HashSet<PeerId> = second.peers().iter().map(|peer| peer.id).collect();
            known.contains(&hub.identity().id) && known.contains(&first.identity().id)
        }));
    }

    #[test]
    fn test_claimed_identity_must_match_key() {
        let honest = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let impostor = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let observer = start_test_overlay(Dispatcher::new(), &[]).unwrap();

        // The impostor's socket, presented under the honest node's id
        let forged = PeerIdentity::new(impostor.identity().address.clone(), honest.identity().id);
        let result = observer.ping_peer(&forged);

        assert!(matches!(result, Err(LedgerError::PeerUnreachable { .. })));
        assert!(!observer
            .peers()
            .iter()
            .any(|peer| peer.id == honest.identity().id));

        assert_eq!(&observer.ping_peer(honest.identity()).unwrap(), honest.identity());
    }

    #[test]
    fn test_sender_identity_is_the_handshake_key() {
        let log = Arc::new(SenderLog::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_message::<Account>();
        dispatcher.register_handler(Account::KIND, log.clone());
        let receiver = start_test_overlay(dispatcher, &[]).unwrap();
        let sender = start_test_overlay(Dispatcher::new(), &seed_of(&receiver)).unwrap();

        let account = Account::new("addr-9", "04aa").unwrap();
        send_one(&sender, &receiver, Account::KIND, &account.to_bytes().unwrap()).unwrap();

        assert_eq!(*log.senders.lock().unwrap(), vec![sender.identity().id]);
    }

    #[test]
    fn test_malformed_message_closes_connection() {
        let sink = Arc::new(RecordingSink::default());
        let receiver = start_test_overlay(Dispatcher::for_ledger(sink.clone()), &[]).unwrap();
        let sender = start_test_overlay(Dispatcher::new(), &seed_of(&receiver)).unwrap();
        assert!(sender.is_connected(&receiver.identity().id));

        let outcome = send_one(&sender, &receiver, Account::KIND, &[0xFF; 3]);

        assert!(outcome.is_err());
        assert!(wait_until(Duration::from_secs(5), || !sender
            .is_connected(&receiver.identity().id)));
        assert!(sink.received().is_empty());

        // Only that connection is gone; the node keeps serving
        assert!(sender.ping(&receiver.identity().address.to_string()).is_ok());
    }

    #[test]
    fn test_handler_error_keeps_connection() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_message::<Account>();
        dispatcher.register_handler(Account::KIND, Arc::new(BrokenStore));
        let receiver = start_test_overlay(dispatcher, &[]).unwrap();
        let sender = start_test_overlay(Dispatcher::new(), &seed_of(&receiver)).unwrap();
        let payload = Account::new("addr-3", "04bb").unwrap().to_bytes().unwrap();

        send_one(&sender, &receiver, Account::KIND, &payload).unwrap();
        assert!(sender.is_connected(&receiver.identity().id));

        send_one(&sender, &receiver, Account::KIND, &payload).unwrap();
        assert!(sender.is_connected(&receiver.identity().id));
    }

    #[test]
    fn test_ping_answered_while_table_holds_dead_peers() {
        let busy = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        for _ in 0..40 {
            let dead = parse_address(&closed_port_address()).unwrap();
            busy.add_peer_address(PeerId::random(), dead);
        }
        assert!(wait_until(Duration::from_secs(5), || busy.peers().len() >= 20));

        let newcomer = start_test_overlay(Dispatcher::new(), &[]).unwrap();
        let started = Instant::now();
        let answered = newcomer.ping(&busy.identity().address.to_string()).unwrap();

        assert_eq!(&answered, busy.identity());
        assert!(started.elapsed() < newcomer.timeout());
    }
}
