//! Multi-node tests
//!
//! Nodes are wired together by routing each `handle_package` reply straight into the
//! addressed node, so whole sync exchanges run deterministically without sockets. One test
//! goes over real loopback TCP.

use cpytro_chain::core::{Blockchain, ProofOfWork, Transaction};
use cpytro_chain::miner::NoBroadcast;
use cpytro_chain::network::Outgoing;
use cpytro_chain::{
    request_status, send_tx, ChainConfig, Envelope, MemoryPool, MineOutcome, Miner, MiningConfig,
    NodeConfig, Package, RejectReason, Server, Wallet, MIN_TRANSACTION_FEE,
};
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn easy_config() -> ChainConfig {
    ChainConfig {
        initial_difficulty_bits: 1,
        pow_limit_bits: 1,
        ..ChainConfig::default()
    }
}

fn mining_config() -> MiningConfig {
    MiningConfig {
        check_interval: 64,
        throttle_millis: 0,
        ..MiningConfig::default()
    }
}

struct TestNode {
    server: Server,
    mempool: Arc<MemoryPool>,
    _dir: TempDir,
}

impl TestNode {
    fn new(port: u16) -> TestNode {
        let dir = tempdir().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&dir.path().join("ledger"), &easy_config())
                .unwrap();
        let mempool = Arc::new(MemoryPool::new());
        let config = NodeConfig {
            listen_addr: format!("127.0.0.1:{port}"),
            mining_enabled: false,
            ..NodeConfig::default()
        };
        let server = Server::new(chain, Arc::clone(&mempool), &config).unwrap();
        TestNode {
            server,
            mempool,
            _dir: dir,
        }
    }

    fn chain(&self) -> &Blockchain {
        self.server.blockchain()
    }

    fn miner(&self, key: [u8; 20]) -> Miner {
        Miner::new(
            self.chain().clone(),
            Arc::clone(&self.mempool),
            Arc::new(NoBroadcast),
            key,
            &mining_config(),
        )
    }
}

/// Deliver `initial` messages from node `from` and every reply they cause, until quiet.
fn route(nodes: &BTreeMap<u16, TestNode>, from: u16, initial: Outgoing) -> usize {
    let mut queue: VecDeque<(u16, SocketAddr, Package)> = initial
        .into_iter()
        .map(|(addr, package)| (from, addr, package))
        .collect();
    let mut delivered = 0;
    while let Some((sender, addr, package)) = queue.pop_front() {
        delivered += 1;
        assert!(delivered < 10_000, "message storm");
        let to = addr.port();
        let Some(target) = nodes.get(&to) else {
            continue;
        };
        let envelope = nodes[&sender].server.envelope(package);
        let replies = target.server.handle_package(LOCALHOST, envelope).unwrap();
        queue.extend(replies.into_iter().map(|(addr, package)| (to, addr, package)));
    }
    delivered
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(LOCALHOST, port)
}

fn hello_to(nodes: &BTreeMap<u16, TestNode>, from: u16, to: u16) {
    let hello = nodes[&from].server.hello();
    route(nodes, from, vec![(addr(to), hello)]);
}

#[test]
fn test_late_joiners_catch_up_through_hello() {
    let mut nodes = BTreeMap::new();
    for port in [4001, 4002, 4003] {
        nodes.insert(port, TestNode::new(port));
    }
    let miner = nodes[&4001].miner([1u8; 20]);
    for _ in 0..5 {
        assert!(matches!(miner.mine_once().unwrap(), MineOutcome::Found(_)));
    }

    hello_to(&nodes, 4002, 4001);
    assert_eq!(nodes[&4002].chain().height(), 6);
    assert_eq!(nodes[&4002].chain().tip_hash(), nodes[&4001].chain().tip_hash());

    // 4003 only knows 4002, and learns about 4001 from its Peers reply
    hello_to(&nodes, 4003, 4002);
    assert_eq!(nodes[&4003].chain().tip_hash(), nodes[&4001].chain().tip_hash());
    assert!(nodes[&4003].server.nodes().node_is_known(&addr(4001)));
    assert!(nodes[&4001].server.nodes().node_is_known(&addr(4003)));

    for node in nodes.values() {
        assert_eq!(
            Blockchain::replay(&node.chain().blocks_from(0, usize::MAX).unwrap()),
            node.chain().utxo_snapshot().unwrap()
        );
    }
}

#[test]
fn test_new_block_propagates_to_all_peers() {
    let mut nodes = BTreeMap::new();
    for port in [4101, 4102, 4103] {
        nodes.insert(port, TestNode::new(port));
    }
    hello_to(&nodes, 4102, 4101);
    hello_to(&nodes, 4103, 4101);

    let MineOutcome::Found(block) = nodes[&4101].miner([1u8; 20]).mine_once().unwrap() else {
        panic!("expected a block");
    };
    let announce: Outgoing = nodes[&4101]
        .server
        .nodes()
        .get_nodes()
        .iter()
        .map(|node| (node.get_addr(), Package::NewBlock { block: block.clone() }))
        .collect();
    route(&nodes, 4101, announce);

    for node in nodes.values() {
        assert_eq!(node.chain().tip().unwrap(), block);
    }
}

#[test]
fn test_first_commit_wins_race() {
    let mut nodes = BTreeMap::new();
    for port in [4201, 4202] {
        nodes.insert(port, TestNode::new(port));
    }
    hello_to(&nodes, 4202, 4201);

    // Both nodes solve a block on the same tip; 4201's reaches 4202 first
    let mut loser = nodes[&4202].chain().new_candidate_block([2u8; 20], vec![]).unwrap();
    let (nonce, _) = ProofOfWork::new_proof_of_work(loser.header().clone()).run();
    loser.set_nonce(nonce);

    let MineOutcome::Found(winner) = nodes[&4201].miner([1u8; 20]).mine_once().unwrap() else {
        panic!("expected a block");
    };
    route(&nodes, 4201, vec![(addr(4202), Package::NewBlock { block: winner.clone() })]);

    let err = nodes[&4202].chain().commit(&loser).unwrap_err();
    assert_eq!(err.reject_reason(), Some(&RejectReason::PreviousHashMismatch));

    // The loser's miner starts over on the winner
    let MineOutcome::Found(next) = nodes[&4202].miner([2u8; 20]).mine_once().unwrap() else {
        panic!("expected a block");
    };
    assert_eq!(next.get_height(), 2);
    assert_eq!(*next.get_previous_hash(), winner.hash());
}

#[test]
fn test_transactions_relay_and_get_mined() {
    let mut nodes = BTreeMap::new();
    for port in [4301, 4302, 4303] {
        nodes.insert(port, TestNode::new(port));
    }
    hello_to(&nodes, 4302, 4301);
    hello_to(&nodes, 4303, 4301);

    let alice = Wallet::new().unwrap();
    let MineOutcome::Found(funding) = nodes[&4301].miner(alice.locking_key()).mine_once().unwrap()
    else {
        panic!("expected a block");
    };
    route(&nodes, 4301, vec![
        (addr(4302), Package::NewBlock { block: funding.clone() }),
        (addr(4303), Package::NewBlock { block: funding }),
    ]);

    let tx = Transaction::new_utxo_transaction(
        &alice,
        &[7u8; 20],
        50_000,
        MIN_TRANSACTION_FEE,
        nodes[&4303].chain(),
    )
    .unwrap();
    // A wallet client submits to 4303, which relays to its peers
    let submit = Envelope::new([0xab; 16], 0, Package::Tx { transaction: tx.clone() });
    let relays = nodes[&4303].server.handle_package(LOCALHOST, submit).unwrap();
    route(&nodes, 4303, relays);
    for node in nodes.values() {
        assert!(node.mempool.contains(&tx.id()));
    }

    let MineOutcome::Found(block) = nodes[&4302].miner([2u8; 20]).mine_once().unwrap() else {
        panic!("expected a block");
    };
    assert_eq!(block.get_transactions()[1], tx);
    assert!(nodes[&4302].mempool.is_empty());
    assert_eq!(nodes[&4302].chain().balance(&[7u8; 20]).unwrap(), 50_000);
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn test_status_and_submission_over_tcp() {
    let port = free_port();
    let node = TestNode::new(port);
    let server = node.server.clone();
    thread::spawn(move || server.run());

    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(addr(port)).is_err() {
        assert!(Instant::now() < deadline, "server did not start");
        thread::sleep(Duration::from_millis(20));
    }

    let status = request_status(addr(port), Duration::from_secs(5)).unwrap();
    assert_eq!(status.height, 1);
    assert_eq!(status.tip_hash, node.chain().tip_hash());

    let alice = Wallet::new().unwrap();
    node.miner(alice.locking_key()).mine_once().unwrap();
    let tx = Transaction::new_utxo_transaction(
        &alice,
        &[8u8; 20],
        1_000,
        MIN_TRANSACTION_FEE,
        node.chain(),
    )
    .unwrap();
    send_tx(addr(port), &tx, Duration::from_secs(5)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !node.mempool.contains(&tx.id()) {
        assert!(Instant::now() < deadline, "transaction never reached the mempool");
        thread::sleep(Duration::from_millis(20));
    }
    let status = request_status(addr(port), Duration::from_secs(5)).unwrap();
    assert_eq!(status.height, 2);
    assert_eq!(status.mempool_size, 1);
}
