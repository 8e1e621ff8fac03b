//! Overlay integration tests
//!
//! Real nodes on loopback ports: discovery through a shared seed,
//! best-effort broadcast of accounts into peers' chain stores, and block
//! announcements crossing between nodes.

use ledger_node::{
    Account, AccountSink, Block, Blockchain, Dispatcher, HandlerContext, LedgerError, Message,
    MessageHandler, Overlay, OverlayConfig, PeerId, Transaction,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

fn local_config() -> OverlayConfig {
    OverlayConfig {
        bind_host: "127.0.0.1".parse().unwrap(),
        bind_port: 0,
        timeout: Duration::from_secs(2),
        ..OverlayConfig::default()
    }
}

/// A node whose dispatcher persists accounts into its own chain store
struct TestNode {
    overlay: Overlay,
    chain: Arc<Blockchain>,
    _dir: TempDir,
}

fn start_node(seeds: &[String]) -> TestNode {
    start_node_with(seeds, |_| {})
}

fn start_node_with<F: FnOnce(&mut Dispatcher)>(seeds: &[String], extend: F) -> TestNode {
    let dir = tempdir().unwrap();
    let chain = Arc::new(Blockchain::create(dir.path().join("chain")).unwrap());
    let sink: Arc<dyn AccountSink> = chain.clone();
    let mut dispatcher = Dispatcher::for_ledger(sink);
    extend(&mut dispatcher);
    let overlay = Overlay::start(
        local_config(),
        ledger_node::new_node_keypair(),
        Arc::new(dispatcher),
        seeds,
    )
    .unwrap();
    TestNode {
        overlay,
        chain,
        _dir: dir,
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn known_ids(overlay: &Overlay) -> HashSet<PeerId> {
    overlay.peers().iter().map(|peer| peer.id).collect()
}

fn address_of(node: &TestNode) -> Vec<String> {
    vec![node.overlay.identity().address.to_string()]
}

/// Keeps every block announced to the node, with who announced it.
#[derive(Default)]
struct AnnouncedBlocks {
    blocks: Mutex<Vec<(PeerId, Block)>>,
}

impl MessageHandler for AnnouncedBlocks {
    fn handle(&self, ctx: &HandlerContext<'_>) -> ledger_node::Result<()> {
        let block = ctx.decode::<Block>()?;
        self.blocks.lock().unwrap().push((ctx.sender().id, block));
        Ok(())
    }
}

#[test]
fn test_nodes_discover_each_other_through_seed() {
    let seed = start_node(&[]);
    let seed_addr = address_of(&seed);

    let first = start_node(&seed_addr);
    let second = start_node(&seed_addr);
    let third = start_node(&seed_addr);

    // The last joiner learns everyone through the seed's answer
    assert!(wait_until(Duration::from_secs(5), || {
        let ids = known_ids(&third.overlay);
        ids.contains(&seed.overlay.identity().id)
            && ids.contains(&first.overlay.identity().id)
            && ids.contains(&second.overlay.identity().id)
    }));

    // Earlier joiners are admitted by peers that heard from them
    assert!(wait_until(Duration::from_secs(5), || {
        seed.overlay.peers().len() == 3
    }));
    assert!(!known_ids(&first.overlay).contains(&first.overlay.identity().id));
}

#[test]
fn test_ping_unreachable_address() {
    let node = start_node(&[]);
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let result = node.overlay.ping(&closed);
    assert!(matches!(
        result,
        Err(LedgerError::PeerUnreachable { .. }) | Err(LedgerError::NetworkTimeout(_))
    ));
    assert!(node.overlay.peers().is_empty());
}

#[test]
fn test_broadcast_skips_departed_peers() {
    let hub = start_node(&[]);
    let hub_addr = address_of(&hub);

    let staying: Vec<TestNode> = (0..2).map(|_| start_node(&hub_addr)).collect();
    let leaving: Vec<TestNode> = (0..2).map(|_| start_node(&hub_addr)).collect();
    assert!(wait_until(Duration::from_secs(5), || {
        hub.overlay.peers().len() == 4
    }));

    let departed: HashSet<PeerId> = leaving
        .iter()
        .map(|node| node.overlay.identity().id)
        .collect();
    drop(leaving);

    let account = Account::new("addr-42", "04cafe")
        .unwrap()
        .with_attribute("team", "blue");
    let started = Instant::now();
    let deliveries = hub.overlay.broadcast(&account).unwrap();

    assert!(started.elapsed() < Duration::from_secs(2) * 2);
    assert_eq!(deliveries.len(), 4);
    let failed: HashSet<PeerId> = deliveries
        .iter()
        .filter(|d| !d.is_delivered())
        .map(|d| d.peer.id)
        .collect();
    assert_eq!(failed, departed);

    for node in &staying {
        assert!(wait_until(Duration::from_secs(5), || {
            matches!(node.chain.get_account(b"addr-42"), Ok(Some(_)))
        }));
        assert_eq!(
            node.chain.get_account(b"addr-42").unwrap(),
            Some(account.clone())
        );
    }
    assert_eq!(hub.chain.get_account(b"addr-42").unwrap(), None);
}

#[test]
fn test_block_announcement_crosses_nodes() {
    let announced = Arc::new(AnnouncedBlocks::default());
    let recorder = announced.clone();
    let listener = start_node_with(&[], move |dispatcher| {
        dispatcher.register_handler(Block::KIND, recorder);
    });
    let announcer = start_node(&address_of(&listener));

    let appended = announcer
        .chain
        .append(&[Transaction::new(b"ship it".to_vec())])
        .unwrap();
    let tip = announcer.chain.get_tip_block().unwrap();
    assert_eq!(tip, appended);

    let deliveries = announcer.overlay.broadcast(&tip).unwrap();

    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].is_delivered());
    let blocks = announced.blocks.lock().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, announcer.overlay.identity().id);
    assert_eq!(blocks[0].1, appended);
    assert!(blocks[0].1.verify_hash());

    // Announcements are not adopted into the listener's chain
    assert_eq!(listener.chain.get_best_height().unwrap(), 0);
}
