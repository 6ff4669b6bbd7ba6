//! Protocol message definitions and constants
//!
//! Defines the closed set of peer-to-peer messages the engine understands,
//! the primitive identifier types they carry, and the protocol constants
//! that bound request and response sizes. Wire framing (length prefixes,
//! checksums, transport encryption) lives outside this crate; messages
//! arrive and leave as typed values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

/// Maximum number of entries in an inv or getdata message.
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum number of headers per headers message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum number of new blocks announced via direct headers instead of a
/// getheaders round trip.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Number of unconnecting headers messages tolerated before each penalty.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// Sliding window (in blocks past the common ancestor) within which blocks
/// may be fetched out of order during initial sync.
pub const BLOCK_DOWNLOAD_WINDOW: u32 = 1_024;

/// Maximum blocks simultaneously requested from a single peer.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;

/// A peer stalling the download window is given this long before disconnect.
pub const BLOCK_STALLING_TIMEOUT_MS: u64 = 2_000;

/// Block request timeout: base factor in units of the target block interval.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: f64 = 1.0;
/// Additional timeout factor per parallel downloading peer.
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: f64 = 0.5;

/// Headers sync timeout: flat base.
pub const HEADERS_DOWNLOAD_TIMEOUT_BASE_MS: u64 = 15 * 60 * 1_000;
/// Headers sync timeout: allowance per header we expect to catch up on.
pub const HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER_MS: u64 = 1;

/// Misbehavior score at which a peer is marked for discouragement.
pub const DISCOURAGEMENT_THRESHOLD: u32 = 100;

/// Consider evicting an outbound peer whose chain never catches up after
/// this long.
pub const CHAIN_SYNC_TIMEOUT_MS: u64 = 20 * 60 * 1_000;
/// Grace period for the final getheaders sent to a lagging outbound peer.
pub const HEADERS_RESPONSE_TIME_MS: u64 = 2 * 60 * 1_000;
/// How often to check for stale tips.
pub const STALE_CHECK_INTERVAL_MS: u64 = 10 * 60 * 1_000;
/// How often to run extra-outbound-peer eviction.
pub const EXTRA_PEER_CHECK_INTERVAL_MS: u64 = 45 * 1_000;
/// Outbound peers younger than this are never evicted as extras.
pub const MINIMUM_CONNECT_TIME_MS: u64 = 30 * 1_000;
/// At most this many outbound peers are protected from chain-sync eviction.
pub const MAX_OUTBOUND_PEERS_TO_PROTECT: usize = 4;

/// Orphan transactions expire after this long.
pub const ORPHAN_TX_EXPIRE_TIME_MS: u64 = 20 * 60 * 1_000;
/// Minimum interval between orphan expiry sweeps.
pub const ORPHAN_TX_EXPIRE_INTERVAL_MS: u64 = 5 * 60 * 1_000;

/// Announced transactions from inbound peers are requested after this delay,
/// giving outbound peers first shot.
pub const INBOUND_PEER_TX_DELAY_MS: u64 = 2_000;
/// Minimum interval between requests for the same transaction across peers.
pub const GETDATA_TX_INTERVAL_MS: u64 = 60_000;
/// Random jitter added when scheduling a deferred transaction request.
pub const MAX_GETDATA_RANDOM_DELAY_MS: u64 = 2_000;
/// In-flight transaction requests expire after this many getdata intervals.
pub const TX_EXPIRY_INTERVAL_FACTOR: u64 = 10;
/// Maximum simultaneous transaction requests to one peer.
pub const MAX_PEER_TX_IN_FLIGHT: usize = 100;
/// Maximum unprocessed transaction announcements tracked per peer.
pub const MAX_PEER_TX_ANNOUNCEMENTS: usize = 5_000;

/// Relayed transactions stay retrievable for this long.
pub const RELAY_TX_CACHE_TIME_MS: u64 = 15 * 60 * 1_000;
/// Average inbound inv trickle interval.
pub const INVENTORY_BROADCAST_INTERVAL_MS: u64 = 5_000;
/// Maximum transaction invs per trickle cycle.
pub const INVENTORY_BROADCAST_MAX: usize = 35;
/// Average interval between addr trickles to a peer.
pub const AVG_ADDRESS_BROADCAST_INTERVAL_MS: u64 = 30 * 1_000;
/// Average interval between feefilter updates to a peer.
pub const AVG_FEEFILTER_BROADCAST_INTERVAL_MS: u64 = 10 * 60 * 1_000;
/// Maximum addresses per addr message.
pub const MAX_ADDR_TO_SEND: usize = 1_000;

/// Maximum filters served per getcfilters request.
pub const MAX_GETCFILTERS_SIZE: u32 = 1_000;
/// Maximum filter headers served per getcfheaders request.
pub const MAX_GETCFHEADERS_SIZE: u32 = 2_000;
/// The only filter type served.
pub const FILTER_TYPE_BASIC: u8 = 0;

/// Maximum number of items in a single poll message.
pub const MAX_POLL_ELEMENTS: usize = 16;

/// Number of recently validated block transactions kept for compact block
/// reconstruction.
pub const BLOCK_RECONSTRUCTION_EXTRA_TXN: usize = 100;

/// Service bit: peer serves the full chain.
pub const SERVICE_NETWORK: u64 = 1 << 0;
/// Service bit: peer serves compact filters.
pub const SERVICE_COMPACT_FILTERS: u64 = 1 << 6;
/// Service bit: peer serves at least the most recent blocks.
pub const SERVICE_NETWORK_LIMITED: u64 = 1 << 10;

/// Compact block protocol version this engine speaks.
pub const CMPCTBLOCK_VERSION: u64 = 1;

/// A block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

/// A transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Opaque peer connection identifier assigned by the connection layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

/// Reference to a transaction output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

/// Transaction input.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
}

/// Transaction output.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
}

/// A transaction. Script contents are opaque to the relay layer; only ids,
/// input references, and sizes matter here.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction id: double sha256 over a canonical field encoding.
    pub fn txid(&self) -> TxId {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update((self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.prevout.txid.0);
            hasher.update(input.prevout.index.to_le_bytes());
        }
        hasher.update((self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            hasher.update(output.value.to_le_bytes());
        }
        hasher.update(self.lock_time.to_le_bytes());
        let first = hasher.finalize();
        let second = Sha256::digest(first);
        let mut id = [0u8; 32];
        id.copy_from_slice(&second);
        TxId(id)
    }

    /// Approximate serialized size in bytes.
    pub fn size(&self) -> usize {
        10 + self.inputs.len() * 41 + self.outputs.len() * 9
    }
}

/// Block header.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: [u8; 32],
    /// Block time, seconds since the epoch.
    pub time: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Header hash: double sha256 over a canonical field encoding.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.prev_hash.0);
        hasher.update(self.merkle_root);
        hasher.update(self.time.to_le_bytes());
        hasher.update(self.bits.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        let first = hasher.finalize();
        let second = Sha256::digest(first);
        let mut id = [0u8; 32];
        id.copy_from_slice(&second);
        BlockHash(id)
    }
}

/// A full block.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

/// Inventory item carried by inv, getdata, and notfound messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum InvItem {
    Block(BlockHash),
    /// Request the block as a compact block instead of a full one.
    CompactBlock(BlockHash),
    Tx(TxId),
}

impl InvItem {
    pub fn is_block_type(&self) -> bool {
        matches!(self, InvItem::Block(_) | InvItem::CompactBlock(_))
    }
}

/// Network address with metadata, as relayed in addr messages.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NetAddress {
    /// Last-seen time in seconds since the epoch.
    pub time: u64,
    pub services: u64,
    pub addr: IpAddr,
    pub port: u16,
}

/// Version handshake payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Whether the peer wants transaction relay on this connection.
    pub relay: bool,
}

/// 6-byte short transaction id used in compact blocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ShortId(pub [u8; 6]);

/// Compact block: header plus short ids, with a few transactions prefilled.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CompactBlock {
    pub header: BlockHeader,
    /// Per-block salt mixed into short id computation.
    pub nonce: u64,
    pub short_ids: Vec<ShortId>,
    /// (absolute index, transaction) pairs the sender chose to include.
    pub prefilled: Vec<(u32, Transaction)>,
}

impl CompactBlock {
    /// Build a compact block from a full block, prefilling the coinbase.
    pub fn from_block(block: &Block, nonce: u64) -> Self {
        let header_hash = block.header.hash();
        let mut short_ids = Vec::new();
        let mut prefilled = Vec::new();
        for (i, tx) in block.txs.iter().enumerate() {
            if i == 0 {
                prefilled.push((0u32, tx.clone()));
            } else {
                short_ids.push(short_tx_id(&header_hash, nonce, &tx.txid()));
            }
        }
        CompactBlock {
            header: block.header,
            nonce,
            short_ids,
            prefilled,
        }
    }

    /// Total number of transactions in the underlying block.
    pub fn total_tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }
}

/// Compute the short id for a transaction under a block's salt.
pub fn short_tx_id(header_hash: &BlockHash, nonce: u64, txid: &TxId) -> ShortId {
    let mut hasher = Sha256::new();
    hasher.update(header_hash.0);
    hasher.update(nonce.to_le_bytes());
    hasher.update(txid.0);
    let digest = hasher.finalize();
    let mut id = [0u8; 6];
    id.copy_from_slice(&digest[..6]);
    ShortId(id)
}

/// Request for specific transactions of a block, by index.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockTransactionsRequest {
    pub block_hash: BlockHash,
    pub indices: Vec<u32>,
}

/// Response carrying the requested block transactions in index order.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockTransactions {
    pub block_hash: BlockHash,
    pub txs: Vec<Transaction>,
}

/// A query for verdicts on a set of inventory items.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PollMessage {
    pub round: u64,
    pub items: Vec<InvItem>,
}

/// One verdict in a poll response. Zero means acceptable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub error: i32,
    pub item_hash: [u8; 32],
}

/// Response to a poll.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PollResponseMessage {
    pub round: u64,
    pub cooldown: u32,
    pub votes: Vec<Vote>,
}

/// The closed set of messages the engine processes and emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<NetAddress>),
    GetAddr,
    SendHeaders,
    SendCmpct { announce: bool, version: u64 },
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetHeaders { locator: Vec<BlockHash>, stop: BlockHash },
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    CmpctBlock(CompactBlock),
    GetBlockTxn(BlockTransactionsRequest),
    BlockTxn(BlockTransactions),
    Mempool,
    FeeFilter(u64),
    FilterLoad { data: Vec<u8>, num_hashes: u32, tweak: u32 },
    FilterAdd(Vec<u8>),
    FilterClear,
    GetCfilters { filter_type: u8, start_height: u32, stop_hash: BlockHash },
    Cfilter { filter_type: u8, block_hash: BlockHash, filter: Vec<u8> },
    GetCfheaders { filter_type: u8, start_height: u32, stop_hash: BlockHash },
    Cfheaders { filter_type: u8, stop_hash: BlockHash, prev_header: BlockHash, headers: Vec<BlockHash> },
    GetCfcheckpt { filter_type: u8, stop_hash: BlockHash },
    Cfcheckpt { filter_type: u8, stop_hash: BlockHash, headers: Vec<BlockHash> },
    Poll(PollMessage),
    PollResponse(PollResponseMessage),
}

impl Message {
    /// Short command name for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::SendHeaders => "sendheaders",
            Message::SendCmpct { .. } => "sendcmpct",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn(_) => "getblocktxn",
            Message::BlockTxn(_) => "blocktxn",
            Message::Mempool => "mempool",
            Message::FeeFilter(_) => "feefilter",
            Message::FilterLoad { .. } => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::GetCfilters { .. } => "getcfilters",
            Message::Cfilter { .. } => "cfilter",
            Message::GetCfheaders { .. } => "getcfheaders",
            Message::Cfheaders { .. } => "cfheaders",
            Message::GetCfcheckpt { .. } => "getcfcheckpt",
            Message::Cfcheckpt { .. } => "cfcheckpt",
            Message::Poll(_) => "poll",
            Message::PollResponse(_) => "pollresponse",
        }
    }
}
