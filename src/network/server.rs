use crate::config::NodeConfig;
use crate::core::{Block, Blockchain, Transaction, MIN_TRANSACTION_FEE};
use crate::error::{BlockchainError, Result};
use crate::miner::{BlockBroadcaster, MinerHandle};
use crate::network::message::{
    read_frame, write_frame, Envelope, NodeId, NodeStatus, Package, MAX_BATCH_BYTES,
    MAX_BLOCKS_PER_BATCH, MAX_PEER_ADDRESSES,
};
use crate::network::{Nodes, PeerManager};
use crate::storage::MemoryPool;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

/// Messages to send after handling one inbound package
pub type Outgoing = Vec<(SocketAddr, Package)>;

enum BlockVerdict {
    Committed,
    Known,
    /// Higher than our next height; we are missing blocks in between
    Ahead,
    /// Below our next height and not ours: a losing fork, ignored
    Stale,
    Rejected,
}

/// P2P server: accepts framed messages, feeds blocks and transactions into the ledger and
/// mempool, and keeps peers in sync by dialing replies back to their listening port.
#[derive(Clone)]
pub struct Server {
    blockchain: Blockchain,
    mempool: Arc<MemoryPool>,
    nodes: Arc<Nodes>,
    peer_manager: PeerManager,
    miner: Option<MinerHandle>,
    node_id: NodeId,
    listening_port: u16,
    config: Arc<NodeConfig>,
    // First storage failure seen by any connection; stops the accept loop
    fatal: Arc<RwLock<Option<BlockchainError>>>,
}

impl Server {
    pub fn new(blockchain: Blockchain, mempool: Arc<MemoryPool>, config: &NodeConfig) -> Result<Self> {
        Ok(Self {
            blockchain,
            mempool,
            nodes: Arc::new(Nodes::new(config.max_peer_strikes)),
            peer_manager: PeerManager::new(config.max_open_connections),
            miner: None,
            node_id: *uuid::Uuid::new_v4().as_bytes(),
            listening_port: config.listening_port()?,
            config: Arc::new(config.clone()),
            fatal: Arc::new(RwLock::new(None)),
        })
    }

    /// Report this miner's status in `Status` replies.
    pub fn with_miner(mut self, miner: MinerHandle) -> Self {
        self.miner = Some(miner);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            height: self.blockchain.height(),
            tip_hash: self.blockchain.tip_hash(),
            issued_supply: self.blockchain.issued_supply(),
            mempool_size: self.mempool.len() as u64,
            active_peers: self.nodes.len() as u64,
            mining: self
                .miner
                .as_ref()
                .map(MinerHandle::status)
                .unwrap_or_default(),
        }
    }

    pub fn hello(&self) -> Package {
        Package::Hello {
            listening_port: self.listening_port,
            height: self.blockchain.height(),
        }
    }

    pub fn envelope(&self, package: Package) -> Envelope {
        Envelope::new(self.node_id, self.listening_port, package)
    }

    /// Storage failure that stopped the server, if any
    pub fn fatal_error(&self) -> Option<BlockchainError> {
        self.fatal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Halt mining and the accept loop; the ledger can no longer be trusted.
    fn record_fatal(&self, e: BlockchainError) {
        error!("Fatal storage error, shutting down: {e}");
        {
            let mut fatal = self.fatal.write().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
        if let Some(miner) = &self.miner {
            miner.stop();
        }
        // Wake the accept loop so it sees the flag
        let own = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.listening_port);
        if let Err(e) = TcpStream::connect_timeout(&own, Duration::from_millis(500)) {
            debug!("Could not wake listener at {own}: {e}");
        }
    }

    /// Run the server until a connection hits a fatal storage error, which is returned.
    pub fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr.as_str();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;

        if let Some(e) = self.fatal_error() {
            return Err(e);
        }
        info!("Server listening on {addr}");
        self.start_resync();

        for stream in listener.incoming() {
            if let Some(e) = self.fatal_error() {
                return Err(e);
            }
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };

                    if !self
                        .peer_manager
                        .should_accept_connection()
                        .unwrap_or(false)
                    {
                        warn!("Rejecting connection from {peer_addr}: connection limit reached");
                        continue;
                    }

                    if let Err(e) = self.peer_manager.record_connection(peer_addr) {
                        warn!("Failed to record connection: {e}");
                    }

                    let server = self.clone();
                    thread::spawn(move || {
                        let result = server.handle_connection(stream, peer_addr);

                        if let Err(e) = server.peer_manager.record_disconnection(peer_addr) {
                            warn!("Failed to record disconnection: {e}");
                        }

                        match result {
                            Err(e) if e.is_fatal() => server.record_fatal(e),
                            Err(e) => error!("Error handling connection from {peer_addr}: {e}"),
                            Ok(()) => {}
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }

        Ok(())
    }

    // Hello every known peer and every seed on a fixed interval, starting immediately
    fn start_resync(&self) {
        let server = self.clone();
        let seeds = PeerManager::seed_addresses(&self.config.peers);
        let interval = Duration::from_secs(self.config.resync_interval_secs.max(1));

        thread::spawn(move || loop {
            if server.fatal_error().is_some() {
                break;
            }
            let mut targets: Vec<SocketAddr> =
                server.nodes.get_nodes().iter().map(|node| node.get_addr()).collect();
            for seed in &seeds {
                if !targets.contains(seed) {
                    targets.push(*seed);
                }
            }
            let hello = server.hello();
            server.dispatch(targets.into_iter().map(|addr| (addr, hello.clone())).collect());
            thread::sleep(interval);
        });
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(self.config.read_timeout_secs)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let mut reader = BufReader::new(&stream);
        while let Some(envelope) = read_frame(&mut reader)? {
            debug!(
                "Received {} from {peer_addr}",
                envelope.package.kind()
            );
            // Status queries come from short-lived clients that do not listen
            let answer_inline = matches!(envelope.package, Package::GetStatus);

            let outgoing = self.handle_package(peer_addr.ip(), envelope)?;
            if answer_inline {
                let mut writer = &stream;
                for (_, package) in outgoing {
                    write_frame(&mut writer, &self.envelope(package))?;
                }
            } else {
                self.dispatch(outgoing);
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    /// Apply one inbound message and return what should be sent in response.
    ///
    /// Only fatal storage errors come back as `Err`; a misbehaving peer is handled here by
    /// striking it.
    pub fn handle_package(&self, from: IpAddr, envelope: Envelope) -> Result<Outgoing> {
        let peer = SocketAddr::new(from, envelope.listening_port);
        if envelope.node_id == self.node_id {
            // Our own address came back through gossip
            self.nodes.evict_node(&peer);
            return Ok(vec![]);
        }

        match envelope.package {
            Package::Hello {
                listening_port,
                height,
            } => self.handle_hello(SocketAddr::new(from, listening_port), height),
            Package::Peers { addresses } => Ok(self.handle_peers(addresses)),
            Package::NewBlock { block } => self.handle_new_block(peer, block),
            Package::GetBlocks { from_height } => self.handle_get_blocks(peer, from_height),
            Package::Blocks { blocks } => self.handle_blocks(peer, blocks),
            Package::Tx { transaction } => self.handle_tx(peer, transaction),
            Package::GetStatus => Ok(vec![(
                peer,
                Package::Status {
                    status: self.status(),
                },
            )]),
            Package::Status { status } => {
                info!(
                    "Peer {peer} is at height {} with {} peers",
                    status.height, status.active_peers
                );
                Ok(vec![])
            }
        }
    }

    fn handle_hello(&self, peer: SocketAddr, height: u64) -> Result<Outgoing> {
        if peer.port() == 0 {
            return Ok(vec![]);
        }
        let is_new = self.nodes.add_node(peer);
        self.nodes.record_height(&peer, height);
        if is_new {
            info!("Added peer {peer} at height {height}");
        }

        let mut outgoing = vec![];
        if is_new {
            outgoing.push((peer, self.hello()));
        }

        let addresses = self.nodes.best_addresses(MAX_PEER_ADDRESSES, &peer);
        if !addresses.is_empty() {
            outgoing.push((
                peer,
                Package::Peers {
                    addresses: addresses.iter().map(SocketAddr::to_string).collect(),
                },
            ));
        }

        let local_height = self.blockchain.height();
        if height < local_height {
            outgoing.extend(self.handle_get_blocks(peer, height)?);
        } else if height > local_height {
            outgoing.push((
                peer,
                Package::GetBlocks {
                    from_height: local_height,
                },
            ));
        }
        Ok(outgoing)
    }

    fn handle_peers(&self, addresses: Vec<String>) -> Outgoing {
        let hello = self.hello();
        addresses
            .iter()
            .take(MAX_PEER_ADDRESSES)
            .filter_map(|addr| addr.parse::<SocketAddr>().ok())
            .filter(|addr| addr.port() != 0 && !self.is_own_address(addr))
            .filter(|addr| self.nodes.add_node(*addr))
            .map(|addr| (addr, hello.clone()))
            .collect()
    }

    fn is_own_address(&self, addr: &SocketAddr) -> bool {
        match self.config.listen_addr.parse::<SocketAddr>() {
            Ok(own) if own == *addr => true,
            _ => addr.ip().is_loopback() && addr.port() == self.listening_port,
        }
    }

    fn handle_new_block(&self, peer: SocketAddr, block: Block) -> Result<Outgoing> {
        let height = block.get_height();
        match self.accept_block(peer, &block)? {
            BlockVerdict::Committed => {
                info!("Added block {} at height {height} from {peer}", block.hash_hex());
                Ok(self.to_all(Package::NewBlock { block }, Some(peer)))
            }
            BlockVerdict::Ahead => Ok(vec![(
                peer,
                Package::GetBlocks {
                    from_height: self.blockchain.height(),
                },
            )]),
            BlockVerdict::Known | BlockVerdict::Stale | BlockVerdict::Rejected => Ok(vec![]),
        }
    }

    fn handle_get_blocks(&self, peer: SocketAddr, from_height: u64) -> Result<Outgoing> {
        let mut blocks = vec![];
        let mut batch_bytes = 0;
        for block in self.blockchain.blocks_from(from_height, MAX_BLOCKS_PER_BATCH)? {
            let size = block.serialized_size();
            if !blocks.is_empty() && batch_bytes + size > MAX_BATCH_BYTES {
                break;
            }
            batch_bytes += size;
            blocks.push(block);
        }
        if blocks.is_empty() {
            return Ok(vec![]);
        }
        debug!("Serving {} blocks from height {from_height} to {peer}", blocks.len());
        Ok(vec![(peer, Package::Blocks { blocks })])
    }

    fn handle_blocks(&self, peer: SocketAddr, blocks: Vec<Block>) -> Result<Outgoing> {
        let mut progressed = false;
        let mut last_committed = None;
        for block in &blocks {
            match self.accept_block(peer, block)? {
                BlockVerdict::Committed => {
                    progressed = true;
                    last_committed = Some(block);
                }
                BlockVerdict::Known | BlockVerdict::Stale => {}
                BlockVerdict::Ahead => {
                    progressed = true;
                    break;
                }
                BlockVerdict::Rejected => return Ok(vec![]),
            }
        }
        if !progressed {
            return Ok(vec![]);
        }
        info!(
            "Synced to height {} from {peer}",
            self.blockchain.height()
        );
        // An empty reply ends the exchange
        let mut outgoing = vec![(
            peer,
            Package::GetBlocks {
                from_height: self.blockchain.height(),
            },
        )];
        // Peers behind us get the new tip; they backfill the rest themselves
        if let Some(block) = last_committed {
            outgoing.extend(self.to_all(
                Package::NewBlock {
                    block: block.clone(),
                },
                Some(peer),
            ));
        }
        Ok(outgoing)
    }

    fn accept_block(&self, peer: SocketAddr, block: &Block) -> Result<BlockVerdict> {
        if self.blockchain.has_block(block)? {
            return Ok(BlockVerdict::Known);
        }
        let local_height = self.blockchain.height();
        if block.get_height() > local_height {
            return Ok(BlockVerdict::Ahead);
        }
        if block.get_height() < local_height {
            debug!(
                "Ignoring competing block {} at height {}",
                block.hash_hex(),
                block.get_height()
            );
            return Ok(BlockVerdict::Stale);
        }

        match self.blockchain.commit(block) {
            Ok(()) => {
                self.mempool.remove_mined(block);
                Ok(BlockVerdict::Committed)
            }
            Err(BlockchainError::Rejected(reason)) => {
                if self.nodes.strike(&peer) {
                    warn!("Evicted peer {peer} after block rejected ({})", reason.rule());
                } else {
                    info!("Struck peer {peer}: block rejected ({})", reason.rule());
                }
                Ok(BlockVerdict::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_tx(&self, peer: SocketAddr, transaction: Transaction) -> Result<Outgoing> {
        let txid = transaction.id();
        if self.mempool.contains(&txid) {
            return Ok(vec![]);
        }
        match self
            .blockchain
            .validate_transaction(&transaction, &HashSet::new())
        {
            Ok(fee) if fee >= MIN_TRANSACTION_FEE => {
                if !self.mempool.add(transaction.clone()) {
                    return Ok(vec![]);
                }
                info!("Accepted transaction {} with fee {fee}", transaction.id_hex());
                Ok(self.to_all(Package::Tx { transaction }, Some(peer)))
            }
            Ok(fee) => {
                debug!(
                    "Dropping transaction {}: fee {fee} below minimum {MIN_TRANSACTION_FEE}",
                    transaction.id_hex()
                );
                Ok(vec![])
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!("Dropping transaction {}: {e}", transaction.id_hex());
                Ok(vec![])
            }
        }
    }

    fn to_all(&self, package: Package, except: Option<SocketAddr>) -> Outgoing {
        self.nodes
            .get_nodes()
            .into_iter()
            .map(|node| node.get_addr())
            .filter(|addr| Some(*addr) != except)
            .map(|addr| (addr, package.clone()))
            .collect()
    }

    /// Send each message, evicting peers that cannot be reached.
    pub fn dispatch(&self, outgoing: Outgoing) {
        let timeout = Duration::from_millis(self.config.peer_timeout_millis);
        for (addr, package) in outgoing {
            let kind = package.kind();
            if let Err(e) = send_envelope(addr, &self.envelope(package), timeout) {
                warn!("Failed to send {kind} to {addr}: {e}");
                self.nodes.evict_node(&addr);
            }
        }
    }
}

impl BlockBroadcaster for Server {
    fn broadcast_block(&self, block: &Block) {
        let outgoing = self.to_all(
            Package::NewBlock {
                block: block.clone(),
            },
            None,
        );
        if outgoing.is_empty() {
            return;
        }
        let server = self.clone();
        thread::spawn(move || server.dispatch(outgoing));
    }
}

fn send_envelope(addr: SocketAddr, envelope: &Envelope, timeout: Duration) -> Result<()> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;

    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

    write_frame(&mut stream, envelope)
}

fn client_envelope(package: Package) -> Envelope {
    // Port 0: clients do not accept dial-backs
    Envelope::new(*uuid::Uuid::new_v4().as_bytes(), 0, package)
}

/// Submit a transaction to the node at `addr`.
pub fn send_tx(addr: SocketAddr, tx: &Transaction, timeout: Duration) -> Result<()> {
    send_envelope(
        addr,
        &client_envelope(Package::Tx {
            transaction: tx.clone(),
        }),
        timeout,
    )
}

/// Ask the node at `addr` for its status and wait for the answer on the same connection.
pub fn request_status(addr: SocketAddr, timeout: Duration) -> Result<NodeStatus> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_read_timeout(Some(timeout))?;

    write_frame(&mut stream, &client_envelope(Package::GetStatus))?;
    match read_frame(&mut stream)? {
        Some(Envelope {
            package: Package::Status { status },
            ..
        }) => Ok(status),
        Some(other) => Err(BlockchainError::Network(format!(
            "Expected status from {addr}, got {}",
            other.package.kind()
        ))),
        None => Err(BlockchainError::Network(format!(
            "{addr} closed the connection without answering"
        ))),
    }
}
