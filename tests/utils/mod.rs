//! Shared fixtures: a recording transport, a mock validation engine that
//! maintains the real block index, and an engine harness with a manual
//! clock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sync_relay_node::chain::{BlockIndex, BlockKey};
use sync_relay_node::interfaces::{
    BanStore, BlockStore, Consensus, HeaderError, Transport, TxValidationResult,
};
use sync_relay_node::mempool::Mempool;
use sync_relay_node::network::peer::{ConnectionKind, NetPermissions};
use sync_relay_node::network::protocol::*;
use sync_relay_node::network::{NetEngine, NetEngineHandles};
use sync_relay_node::utils::Clock;
use sync_relay_node::NetConfig;

/// Engine start time; genesis is timestamped just before it.
pub const T0: u64 = 1_700_000_000_000;

pub fn header(parent: BlockHash, nonce: u64) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_hash: parent,
        merkle_root: [0; 32],
        time: T0 / 1_000 + nonce,
        bits: 0x1d00ffff,
        nonce,
    }
}

pub fn genesis_header() -> BlockHeader {
    header(BlockHash([0; 32]), 0)
}

/// `count` consecutive headers extending `parent`; `salt` keeps separate
/// chains distinct.
pub fn header_chain(parent: BlockHash, count: usize, salt: u64) -> Vec<BlockHeader> {
    let mut out = Vec::with_capacity(count);
    let mut prev = parent;
    for i in 0..count {
        let h = header(prev, salt * 1_000_000 + i as u64 + 1);
        prev = h.hash();
        out.push(h);
    }
    out
}

pub fn coinbase(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                txid: TxId([0; 32]),
                index: u32::MAX - tag as u32,
            },
        }],
        outputs: vec![TxOut { value: 50 }],
        lock_time: 0,
    }
}

pub fn spend(parent: TxId, index: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                txid: parent,
                index,
            },
        }],
        outputs: vec![TxOut { value: 1 }, TxOut { value: 2 }],
        lock_time: 0,
    }
}

pub fn block_with(header: BlockHeader, txs: Vec<Transaction>) -> Block {
    Block { header, txs }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, Message)>>,
    disconnected: Mutex<Vec<NodeId>>,
}

impl Transport for RecordingTransport {
    fn send(&self, peer: NodeId, message: Message) {
        self.sent.lock().unwrap().push((peer, message));
    }

    fn disconnect(&self, peer: NodeId) {
        self.disconnected.lock().unwrap().push(peer);
    }
}

impl RecordingTransport {
    /// Drain and return everything sent so far.
    pub fn take_sent(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn sent_to(&self, id: NodeId) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn disconnected_peers(&self) -> Vec<NodeId> {
        self.disconnected.lock().unwrap().clone()
    }
}

/// Validation fake that keeps the shared block index honest: headers are
/// inserted, blocks marked downloaded, and the active tip advanced on more
/// work. Transaction verdicts come from a per-txid table.
pub struct MockConsensus {
    chain: Arc<RwLock<BlockIndex>>,
    pub ibd: AtomicBool,
    pub min_work: Mutex<u128>,
    pub tx_verdicts: Mutex<HashMap<TxId, TxValidationResult>>,
    pub accepted_blocks: Mutex<Vec<BlockHash>>,
}

impl MockConsensus {
    pub fn new(chain: Arc<RwLock<BlockIndex>>) -> Self {
        MockConsensus {
            chain,
            ibd: AtomicBool::new(false),
            min_work: Mutex::new(0),
            tx_verdicts: Mutex::new(HashMap::new()),
            accepted_blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_tx_verdict(&self, txid: TxId, verdict: TxValidationResult) {
        self.tx_verdicts.lock().unwrap().insert(txid, verdict);
    }
}

impl Consensus for MockConsensus {
    fn process_headers(&self, headers: &[BlockHeader]) -> Result<BlockKey, HeaderError> {
        let mut chain = self.chain.write().unwrap();
        let mut last = None;
        for h in headers {
            match chain.insert(*h, 2) {
                Some(key) => last = Some(key),
                None => {
                    return Err(HeaderError {
                        reason: "prev block not found".into(),
                        penalty: 10,
                    })
                }
            }
        }
        last.ok_or_else(|| HeaderError {
            reason: "empty headers".into(),
            penalty: 0,
        })
    }

    fn process_block(&self, block: &Block, _force_processing: bool) -> bool {
        let mut chain = self.chain.write().unwrap();
        let hash = block.header.hash();
        let key = match chain.lookup(&hash) {
            Some(key) => key,
            None => match chain.insert(block.header, 2) {
                Some(key) => key,
                None => return false,
            },
        };
        if chain.get(key).has_data {
            return false;
        }
        chain.mark_has_data(key);
        if chain.get(key).fully_linked && chain.get(key).work > chain.tip_record().work {
            chain.set_active_tip(key);
        }
        self.accepted_blocks.lock().unwrap().push(hash);
        true
    }

    fn accept_transaction(&self, tx: &Transaction) -> TxValidationResult {
        self.tx_verdicts
            .lock()
            .unwrap()
            .get(&tx.txid())
            .cloned()
            .unwrap_or(TxValidationResult::Accepted)
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::Relaxed)
    }

    fn minimum_chain_work(&self) -> u128 {
        *self.min_work.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MapBlockStore {
    blocks: Mutex<HashMap<BlockHash, Block>>,
}

impl MapBlockStore {
    pub fn put(&self, block: Block) {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.header.hash(), block);
    }
}

impl BlockStore for MapBlockStore {
    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.blocks.lock().unwrap().get(hash).cloned()
    }
}

#[derive(Default)]
pub struct MemoryBanStore {
    discouraged: Mutex<Vec<IpAddr>>,
}

impl MemoryBanStore {
    pub fn discouraged_addrs(&self) -> Vec<IpAddr> {
        self.discouraged.lock().unwrap().clone()
    }
}

impl BanStore for MemoryBanStore {
    fn discourage(&self, addr: IpAddr) {
        self.discouraged.lock().unwrap().push(addr);
    }

    fn is_discouraged(&self, addr: IpAddr) -> bool {
        self.discouraged.lock().unwrap().contains(&addr)
    }
}

pub struct Harness {
    pub engine: NetEngine,
    pub chain: Arc<RwLock<BlockIndex>>,
    pub consensus: Arc<MockConsensus>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MapBlockStore>,
    pub ban_store: Arc<MemoryBanStore>,
    pub mempool: Arc<Mempool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(NetConfig::default())
    }

    pub fn with_config(config: NetConfig) -> Self {
        let chain = Arc::new(RwLock::new(BlockIndex::new(genesis_header())));
        let consensus = Arc::new(MockConsensus::new(chain.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MapBlockStore::default());
        let ban_store = Arc::new(MemoryBanStore::default());
        let mempool = Arc::new(Mempool::new());
        let engine = NetEngine::new(
            NetEngineHandles {
                config,
                chain: chain.clone(),
                consensus: consensus.clone(),
                block_store: store.clone(),
                mempool: mempool.clone(),
                transport: transport.clone(),
                ban_store: ban_store.clone(),
                filter_index: None,
                vote_processor: None,
            },
            Clock::manual(T0),
        );
        Harness {
            engine,
            chain,
            consensus,
            transport,
            store,
            ban_store,
            mempool,
        }
    }

    pub fn now(&self) -> u64 {
        self.engine.clock().now_ms()
    }

    pub fn advance(&self, ms: u64) {
        self.engine.clock().set_ms(self.now() + ms);
    }

    pub async fn connect(&self, id: u64, kind: ConnectionKind) -> NodeId {
        self.connect_with(id, kind, NetPermissions::empty()).await
    }

    pub async fn connect_with(
        &self,
        id: u64,
        kind: ConnectionKind,
        permissions: NetPermissions,
    ) -> NodeId {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, id as u8));
        self.connect_from(id, kind, permissions, addr).await
    }

    /// Register a peer and complete its handshake, discarding the
    /// handshake traffic.
    pub async fn connect_from(
        &self,
        id: u64,
        kind: ConnectionKind,
        permissions: NetPermissions,
        addr: IpAddr,
    ) -> NodeId {
        let node = NodeId(id);
        self.engine.peer_connected(node, addr, kind, permissions).await;
        self.engine
            .handle_message(
                node,
                Message::Version(VersionMessage {
                    version: 70016,
                    services: SERVICE_NETWORK,
                    timestamp: self.now() / 1_000,
                    user_agent: "/test:0.1/".into(),
                    start_height: 0,
                    relay: true,
                }),
            )
            .await;
        self.engine.handle_message(node, Message::Verack).await;
        self.transport.take_sent();
        node
    }

    pub fn genesis_hash(&self) -> BlockHash {
        genesis_header().hash()
    }
}
