//! Chain-sync bookkeeping
//!
//! `SyncState` is the single owner of all cross-peer synchronization
//! state: per-peer sync records, the global block in-flight index, derived
//! peer counters, relay queues, and the orphan pool. The engine holds it
//! behind one async mutex; handlers lock it, mutate, and release before
//! calling into validation.

use crate::chain::{BlockIndex, BlockKey};
use crate::network::compact_blocks::PartialBlock;
use crate::network::filters::{PeerBloomFilter, RollingFilter};
use crate::network::orphan_pool::OrphanPool;
use crate::network::protocol::{
    Block, BlockHash, CompactBlock, NetAddress, NodeId, Transaction, TxId,
};
use crate::network::tx_request::TxDownloadState;
use lru::LruCache;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use tracing::debug;

/// Per-peer caps for the recency caches.
const KNOWN_TX_CACHE: usize = 50_000;
const RECENTLY_ANNOUNCED_CACHE: usize = 3_500;
const KNOWN_ADDR_CACHE: usize = 5_000;
/// Global rolling filter sizes.
const RECENT_REJECTS_SIZE: usize = 120_000;
const RECENT_CONFIRMED_SIZE: usize = 24_000;
/// At most this many peers receive new blocks as compact block pushes.
const MAX_COMPACT_ANNOUNCERS: usize = 3;

/// One block requested from a peer.
pub struct QueuedBlock {
    pub hash: BlockHash,
    /// Index entry, present when the header validated before the request.
    pub key: Option<BlockKey>,
    /// In-progress compact block reconstruction, if this request went out
    /// as a compact block.
    pub partial: Option<Box<PartialBlock>>,
}

/// Chain-sync eviction bookkeeping for an outbound peer.
#[derive(Default)]
pub struct ChainSyncTimeout {
    /// Deadline by which the peer must prove knowledge of our tip work.
    pub timeout_at_ms: u64,
    /// Our tip when the timeout was armed.
    pub work_at: Option<BlockKey>,
    /// The warning getheaders has been sent; next timeout disconnects.
    pub sent_getheaders: bool,
    /// Peer is protected from chain-sync eviction.
    pub protect: bool,
}

/// Per-peer synchronization and relay state.
pub struct PeerSyncState {
    /// Best block this peer is known to have, once its header validated.
    pub best_known_block: Option<BlockKey>,
    /// Last block hash the peer announced that we have not validated.
    pub last_unknown_block: Option<BlockHash>,
    /// Last block on the peer's chain that we share and have data for.
    pub last_common_block: Option<BlockKey>,
    /// Best header we have announced to this peer.
    pub best_header_sent: Option<BlockKey>,

    /// Consecutive headers messages that did not connect.
    pub unconnecting_headers: u32,
    /// Initial getheaders has been sent to this peer.
    pub sync_started: bool,
    /// Deadline for completing initial headers sync, `u64::MAX` when unarmed.
    pub headers_sync_timeout_ms: u64,

    /// Outstanding block requests, oldest first.
    pub blocks_in_flight: VecDeque<QueuedBlock>,
    /// How many of those had validated headers.
    pub in_flight_valid_headers: usize,
    /// When the oldest outstanding request was made.
    pub downloading_since_ms: u64,
    /// When this peer first stalled the download window, 0 if not stalling.
    pub stalling_since_ms: u64,

    /// Counts toward the preferred-download peer total.
    pub preferred_download: bool,
    /// Peer asked for header announcements (sendheaders).
    pub prefers_headers: bool,
    /// Peer asked for compact block announcements.
    pub prefers_cmpct: bool,
    /// Peer can answer compact block requests.
    pub provides_cmpct: bool,

    pub chain_sync: ChainSyncTimeout,
    /// Engine-clock time of the peer's last new-block announcement.
    pub last_block_announcement_ms: u64,

    pub tx_download: TxDownloadState,

    /// Blocks to announce via headers, in chain order.
    pub blocks_to_announce: Vec<BlockHash>,
    /// Blocks to announce via inv (fallback when headers would not connect).
    pub blocks_for_inv_relay: Vec<BlockHash>,
    /// Transactions queued for the next inv trickle.
    pub txs_for_inv_relay: Vec<TxId>,
    /// Transactions the peer is known to have; never re-announced.
    pub known_txs: LruCache<TxId, ()>,
    /// Transactions we recently announced to the peer; these may be served
    /// by getdata even before trickle-cache expiry elsewhere.
    pub recently_announced_txs: LruCache<TxId, ()>,
    /// Addresses queued for the next addr trickle.
    pub addrs_to_send: Vec<NetAddress>,
    pub known_addrs: LruCache<u64, ()>,
    /// Peer-loaded transaction filter, if any.
    pub bloom_filter: Option<PeerBloomFilter>,

    pub next_inv_send_ms: u64,
    pub next_addr_send_ms: u64,
    pub next_feefilter_send_ms: u64,
    /// Fee rate last told to the peer via feefilter.
    pub last_sent_feefilter: u64,
}

impl PeerSyncState {
    fn new() -> Self {
        PeerSyncState {
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            unconnecting_headers: 0,
            sync_started: false,
            headers_sync_timeout_ms: u64::MAX,
            blocks_in_flight: VecDeque::new(),
            in_flight_valid_headers: 0,
            downloading_since_ms: 0,
            stalling_since_ms: 0,
            preferred_download: false,
            prefers_headers: false,
            prefers_cmpct: false,
            provides_cmpct: false,
            chain_sync: ChainSyncTimeout::default(),
            last_block_announcement_ms: 0,
            tx_download: TxDownloadState::new(),
            blocks_to_announce: Vec::new(),
            blocks_for_inv_relay: Vec::new(),
            txs_for_inv_relay: Vec::new(),
            known_txs: LruCache::new(NonZeroUsize::new(KNOWN_TX_CACHE).unwrap()),
            recently_announced_txs: LruCache::new(
                NonZeroUsize::new(RECENTLY_ANNOUNCED_CACHE).unwrap(),
            ),
            addrs_to_send: Vec::new(),
            known_addrs: LruCache::new(NonZeroUsize::new(KNOWN_ADDR_CACHE).unwrap()),
            bloom_filter: None,
            next_inv_send_ms: 0,
            next_addr_send_ms: 0,
            next_feefilter_send_ms: 0,
            last_sent_feefilter: 0,
        }
    }
}

/// Outcome of [`SyncState::mark_block_as_in_flight`].
#[derive(Debug, PartialEq, Eq)]
pub enum InFlightResult {
    /// Request registered; caller should send the getdata.
    Registered,
    /// This peer already has this block in flight; no new request.
    AlreadyInFlight,
}

/// All cross-peer synchronization state, owned by one lock.
pub struct SyncState {
    peers: HashMap<NodeId, PeerSyncState>,
    /// Which peer each requested block is in flight from. A block is in
    /// flight from at most one peer.
    in_flight: HashMap<BlockHash, NodeId>,

    /// Peers counted by `PeerSyncState::preferred_download`.
    pub preferred_download_count: usize,
    /// Peers with at least one validated-header block in flight.
    pub validated_download_peers: usize,
    /// Outbound peers currently protected from chain-sync eviction.
    pub protected_outbound_count: usize,
    /// Peers we have started headers sync with.
    pub sync_started_count: usize,

    /// Peers that announce new blocks as compact blocks, most recent last.
    compact_announcers: VecDeque<NodeId>,

    /// Engine-clock time the active tip last advanced.
    pub last_tip_update_ms: u64,
    /// Set when the tip looks stale and an extra outbound peer is wanted.
    pub try_new_outbound_peer: bool,

    /// Txids rejected since the last tip change.
    pub recent_rejects: RollingFilter,
    /// Tip the reject filter was last reset at.
    pub rejects_reset_at: BlockHash,
    /// Txids confirmed in recent blocks.
    pub recent_confirmed: RollingFilter,

    pub orphans: OrphanPool,
    /// Last request time per txid, across all peers.
    pub tx_request_times: HashMap<TxId, u64>,

    /// Recently relayed transactions, retrievable by getdata.
    pub relay_cache: HashMap<TxId, Transaction>,
    /// Relay cache expiry queue, oldest first.
    pub relay_expiry: VecDeque<(u64, TxId)>,

    /// Recently seen loose transactions kept for compact block
    /// reconstruction, oldest first.
    pub extra_txns: VecDeque<(TxId, Transaction)>,

    /// The most recent block we fully validated, kept for fast compact
    /// announcement and getblocktxn service.
    pub most_recent_block: Option<(BlockHash, Block, CompactBlock)>,
    /// Height of the best fast-announced compact block.
    pub highest_fast_announce: u32,

    /// Which peer sent each block we are validating, and whether that peer
    /// may be punished if it proves invalid.
    pub block_source: HashMap<BlockHash, (NodeId, bool)>,

    /// Addresses learned from addr messages, for getaddr service.
    learned_addrs: VecDeque<NetAddress>,

    pub rng: StdRng,
}

impl SyncState {
    pub fn new(now_ms: u64) -> Self {
        let mut rng = StdRng::from_entropy();
        let recent_rejects = RollingFilter::new(RECENT_REJECTS_SIZE, &mut rng);
        let recent_confirmed = RollingFilter::new(RECENT_CONFIRMED_SIZE, &mut rng);
        SyncState {
            peers: HashMap::new(),
            in_flight: HashMap::new(),
            preferred_download_count: 0,
            validated_download_peers: 0,
            protected_outbound_count: 0,
            sync_started_count: 0,
            compact_announcers: VecDeque::new(),
            last_tip_update_ms: now_ms,
            try_new_outbound_peer: false,
            recent_rejects,
            rejects_reset_at: BlockHash::default(),
            recent_confirmed,
            orphans: OrphanPool::new(),
            tx_request_times: HashMap::new(),
            relay_cache: HashMap::new(),
            relay_expiry: VecDeque::new(),
            extra_txns: VecDeque::new(),
            most_recent_block: None,
            highest_fast_announce: 0,
            block_source: HashMap::new(),
            learned_addrs: VecDeque::new(),
            rng,
        }
    }

    pub fn register_peer(&mut self, id: NodeId) {
        self.peers.insert(id, PeerSyncState::new());
    }

    pub fn peer(&self, id: NodeId) -> Option<&PeerSyncState> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: NodeId) -> Option<&mut PeerSyncState> {
        self.peers.get_mut(&id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Tear down a disconnected peer, releasing its in-flight claims and
    /// rebalancing every derived counter.
    pub fn finalize_peer(&mut self, id: NodeId) {
        let Some(state) = self.peers.remove(&id) else {
            return;
        };
        for queued in &state.blocks_in_flight {
            self.in_flight.remove(&queued.hash);
        }
        if state.in_flight_valid_headers > 0 {
            self.validated_download_peers -= 1;
        }
        if state.preferred_download {
            self.preferred_download_count -= 1;
        }
        if state.chain_sync.protect {
            self.protected_outbound_count -= 1;
        }
        if state.sync_started {
            self.sync_started_count -= 1;
        }
        self.compact_announcers.retain(|p| *p != id);
        self.orphans.erase_for_peer(id);

        if self.peers.is_empty() {
            debug_assert!(self.in_flight.is_empty());
            debug_assert_eq!(self.preferred_download_count, 0);
            debug_assert_eq!(self.validated_download_peers, 0);
            debug_assert_eq!(self.protected_outbound_count, 0);
            debug_assert_eq!(self.sync_started_count, 0);
        }
    }

    /// Flip a peer's preferred-download status, keeping the global count in
    /// step.
    pub fn set_preferred_download(&mut self, id: NodeId, preferred: bool) {
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        if state.preferred_download != preferred {
            state.preferred_download = preferred;
            if preferred {
                self.preferred_download_count += 1;
            } else {
                self.preferred_download_count -= 1;
            }
        }
    }

    /// Which peer, if any, has this block in flight.
    pub fn block_in_flight_from(&self, hash: &BlockHash) -> Option<NodeId> {
        self.in_flight.get(hash).copied()
    }

    pub fn blocks_in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolve the peer's last unknown block announcement against the
    /// index, upgrading `best_known_block` if it now validates.
    pub fn process_block_availability(&mut self, chain: &BlockIndex, id: NodeId) {
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        if let Some(hash) = state.last_unknown_block {
            if let Some(key) = chain.lookup(&hash) {
                let better = match state.best_known_block {
                    Some(best) => chain.get(key).work >= chain.get(best).work,
                    None => true,
                };
                if better {
                    state.best_known_block = Some(key);
                }
                state.last_unknown_block = None;
            }
        }
    }

    /// Record that a peer announced or referenced a block hash.
    pub fn update_block_availability(&mut self, chain: &BlockIndex, id: NodeId, hash: BlockHash) {
        self.process_block_availability(chain, id);
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        if let Some(key) = chain.lookup(&hash) {
            let better = match state.best_known_block {
                Some(best) => chain.get(key).work >= chain.get(best).work,
                None => true,
            };
            if better {
                state.best_known_block = Some(key);
            }
        } else {
            state.last_unknown_block = Some(hash);
        }
    }

    /// Whether the peer is believed to have the given indexed block.
    pub fn peer_has_block(&self, chain: &BlockIndex, id: NodeId, key: BlockKey) -> bool {
        let Some(state) = self.peers.get(&id) else {
            return false;
        };
        for candidate in [state.best_known_block, state.last_common_block]
            .into_iter()
            .flatten()
        {
            if chain.get(candidate).height >= chain.get(key).height
                && chain.ancestor_at(candidate, chain.get(key).height) == Some(key)
            {
                return true;
            }
        }
        false
    }

    /// Drop a block from the in-flight index, releasing the owning peer's
    /// slot. Returns the former owner.
    pub fn mark_block_as_received(&mut self, hash: &BlockHash, now_ms: u64) -> Option<NodeId> {
        let owner = self.in_flight.remove(hash)?;
        if let Some(state) = self.peers.get_mut(&owner) {
            let was_front = state
                .blocks_in_flight
                .front()
                .map(|q| q.hash == *hash)
                .unwrap_or(false);
            if let Some(pos) = state.blocks_in_flight.iter().position(|q| q.hash == *hash) {
                let queued = state.blocks_in_flight.remove(pos).unwrap();
                if queued.key.is_some() {
                    state.in_flight_valid_headers -= 1;
                    if state.in_flight_valid_headers == 0 {
                        self.validated_download_peers -= 1;
                    }
                }
            }
            if was_front {
                // The next oldest request starts its timeout clock now.
                state.downloading_since_ms = state.downloading_since_ms.max(now_ms);
            }
            state.stalling_since_ms = 0;
        }
        Some(owner)
    }

    /// Claim a block download slot for a peer. Idempotent for repeated
    /// claims by the same peer; a claim held by another peer is transferred.
    pub fn mark_block_as_in_flight(
        &mut self,
        id: NodeId,
        hash: BlockHash,
        key: Option<BlockKey>,
        partial: Option<Box<PartialBlock>>,
        now_ms: u64,
    ) -> InFlightResult {
        if self.in_flight.get(&hash) == Some(&id) {
            return InFlightResult::AlreadyInFlight;
        }
        // Another peer may hold the claim; release it first.
        self.mark_block_as_received(&hash, now_ms);

        let Some(state) = self.peers.get_mut(&id) else {
            return InFlightResult::AlreadyInFlight;
        };
        if key.is_some() {
            state.in_flight_valid_headers += 1;
            if state.in_flight_valid_headers == 1 {
                self.validated_download_peers += 1;
            }
        }
        if state.blocks_in_flight.is_empty() {
            state.downloading_since_ms = now_ms;
        }
        state.blocks_in_flight.push_back(QueuedBlock { hash, key, partial });
        self.in_flight.insert(hash, id);
        InFlightResult::Registered
    }

    /// Access a peer's in-progress compact block reconstruction.
    pub fn partial_block_mut(
        &mut self,
        id: NodeId,
        hash: &BlockHash,
    ) -> Option<&mut PartialBlock> {
        let state = self.peers.get_mut(&id)?;
        state
            .blocks_in_flight
            .iter_mut()
            .find(|q| q.hash == *hash)
            .and_then(|q| q.partial.as_deref_mut())
    }

    /// Promote a peer to high-bandwidth compact announcer, demoting the
    /// oldest announcer past the cap. Returns peers to demote.
    pub fn add_compact_announcer(&mut self, id: NodeId) -> Vec<NodeId> {
        if self.compact_announcers.contains(&id) {
            // Refresh recency.
            self.compact_announcers.retain(|p| *p != id);
            self.compact_announcers.push_back(id);
            return Vec::new();
        }
        self.compact_announcers.push_back(id);
        let mut demoted = Vec::new();
        while self.compact_announcers.len() > MAX_COMPACT_ANNOUNCERS {
            if let Some(old) = self.compact_announcers.pop_front() {
                debug!("demoting compact announcer {}", old);
                demoted.push(old);
            }
        }
        demoted
    }

    pub fn is_compact_announcer(&self, id: NodeId) -> bool {
        self.compact_announcers.contains(&id)
    }

    pub fn compact_announcers(&self) -> Vec<NodeId> {
        self.compact_announcers.iter().copied().collect()
    }

    /// Whether our tip has not moved for longer than the threshold while we
    /// are not waiting on requested blocks.
    pub fn tip_may_be_stale(&self, threshold_ms: u64, now_ms: u64) -> bool {
        now_ms > self.last_tip_update_ms + threshold_ms && self.in_flight.is_empty()
    }

    /// Whether a transaction needs no download: pooled, orphaned,
    /// recently confirmed, or recently rejected.
    pub fn already_have_tx(&self, txid: &TxId, mempool: &dyn crate::mempool::MempoolView) -> bool {
        self.recent_rejects.contains(&txid.0)
            || self.recent_confirmed.contains(&txid.0)
            || self.orphans.contains(txid)
            || mempool.contains(txid)
    }

    /// Drain this peer's due transaction announcements into a request
    /// batch, respecting the global per-transaction request interval.
    pub fn drain_tx_requests(
        &mut self,
        id: NodeId,
        is_inbound: bool,
        mempool: &dyn crate::mempool::MempoolView,
        now_ms: u64,
    ) -> Vec<TxId> {
        let SyncState {
            peers,
            tx_request_times,
            recent_rejects,
            recent_confirmed,
            orphans,
            rng,
            ..
        } = self;
        let Some(peer_state) = peers.get_mut(&id) else {
            return Vec::new();
        };
        crate::network::tx_request::get_tx_requests(
            &mut peer_state.tx_download,
            is_inbound,
            tx_request_times,
            |txid| {
                recent_rejects.contains(&txid.0)
                    || recent_confirmed.contains(&txid.0)
                    || orphans.contains(txid)
                    || mempool.contains(txid)
            },
            now_ms,
            rng,
        )
    }

    /// Remember an address learned from peers, for getaddr responses.
    pub fn learned_addrs_push(&mut self, addr: NetAddress) {
        self.learned_addrs.push_back(addr);
        while self.learned_addrs.len() > crate::network::protocol::MAX_ADDR_TO_SEND {
            self.learned_addrs.pop_front();
        }
    }

    pub fn learned_addrs(&self) -> Vec<NetAddress> {
        self.learned_addrs.iter().copied().collect()
    }

    /// Record a relayed transaction, expiring old cache entries.
    pub fn cache_relay_tx(&mut self, txid: TxId, tx: Transaction, now_ms: u64) {
        use crate::network::protocol::RELAY_TX_CACHE_TIME_MS;
        self.relay_cache.insert(txid, tx);
        self.relay_expiry.push_back((now_ms + RELAY_TX_CACHE_TIME_MS, txid));
        while let Some(&(expires, id)) = self.relay_expiry.front() {
            if expires > now_ms {
                break;
            }
            self.relay_expiry.pop_front();
            self.relay_cache.remove(&id);
        }
    }

    /// Remember a loose transaction for compact block reconstruction.
    pub fn add_extra_txn(&mut self, tx: Transaction, cap: usize) {
        if cap == 0 {
            return;
        }
        self.extra_txns.push_back((tx.txid(), tx));
        while self.extra_txns.len() > cap {
            self.extra_txns.pop_front();
        }
    }
}
