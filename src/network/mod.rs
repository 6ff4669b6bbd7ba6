//! Network message processing
//!
//! `NetEngine` is the composition root: it owns the chain-sync state, the
//! peer registry, and the trait handles toward validation, storage, and the
//! connection layer. The connection layer feeds it decoded messages and
//! drives the per-peer outbound cycle; validation feeds back tip and block
//! events.

pub mod block_download;
pub mod cfilters;
pub mod compact_blocks;
pub mod eviction;
pub mod filters;
pub mod header_sync;
pub mod orphan_pool;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod sync_state;
pub mod tx_request;
pub mod voting;

use crate::chain::BlockIndex;
use crate::config::NetConfig;
use crate::interfaces::{
    BanStore, BlockStore, Consensus, Transport, TxRejection, TxValidationResult, VoteProcessor,
};
use crate::interfaces::FilterIndex;
use crate::mempool::MempoolView;
use crate::network::filters::PeerBloomFilter;
use crate::network::peer::{ConnectionKind, NetPermissions};
use crate::network::protocol::*;
use crate::network::registry::PeerRegistry;
use crate::network::sync_state::SyncState;
use crate::utils::Clock;
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between keepalive pings.
const PING_INTERVAL_MS: u64 = 2 * 60 * 1_000;
/// Maximum script-element size accepted by filteradd.
const MAX_FILTER_ADD_SIZE: usize = 520;

/// The synchronization and relay engine.
pub struct NetEngine {
    pub(crate) config: NetConfig,
    pub(crate) chain: Arc<RwLock<BlockIndex>>,
    pub(crate) state: Mutex<SyncState>,
    pub(crate) registry: PeerRegistry,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    pub(crate) mempool: Arc<dyn MempoolView>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) ban_store: Arc<dyn BanStore>,
    pub(crate) filter_index: Option<Arc<dyn FilterIndex>>,
    pub(crate) vote_processor: Option<Arc<dyn VoteProcessor>>,
    pub(crate) clock: Clock,
    /// Suspends request scheduling and voting while blocks are imported.
    pub(crate) importing: AtomicBool,
    /// Set on shutdown; long getdata services bail out between items.
    pub(crate) interrupted: AtomicBool,
    pub(crate) next_stale_check_ms: AtomicU64,
    pub(crate) next_extra_peer_check_ms: AtomicU64,
}

/// Everything the engine needs at construction.
pub struct NetEngineHandles {
    pub config: NetConfig,
    pub chain: Arc<RwLock<BlockIndex>>,
    pub consensus: Arc<dyn Consensus>,
    pub block_store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn MempoolView>,
    pub transport: Arc<dyn Transport>,
    pub ban_store: Arc<dyn BanStore>,
    pub filter_index: Option<Arc<dyn FilterIndex>>,
    pub vote_processor: Option<Arc<dyn VoteProcessor>>,
}

impl NetEngine {
    pub fn new(handles: NetEngineHandles, clock: Clock) -> Self {
        let now = clock.now_ms();
        let threshold = handles.config.discouragement_threshold;
        NetEngine {
            registry: PeerRegistry::new(threshold),
            state: Mutex::new(SyncState::new(now)),
            config: handles.config,
            chain: handles.chain,
            consensus: handles.consensus,
            block_store: handles.block_store,
            mempool: handles.mempool,
            transport: handles.transport,
            ban_store: handles.ban_store,
            filter_index: handles.filter_index,
            vote_processor: handles.vote_processor,
            clock,
            importing: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            next_stale_check_ms: AtomicU64::new(now + STALE_CHECK_INTERVAL_MS),
            next_extra_peer_check_ms: AtomicU64::new(now + EXTRA_PEER_CHECK_INTERVAL_MS),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Engine time source; manual clocks are driven through this.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn set_importing(&self, importing: bool) {
        self.importing.store(importing, Ordering::Relaxed);
    }

    /// Ask in-progress message handlers to stop at the next safe point.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub(crate) fn is_importing(&self) -> bool {
        self.importing.load(Ordering::Relaxed)
    }

    pub(crate) fn send(&self, peer: NodeId, message: Message) {
        self.transport.send(peer, message);
    }

    pub(crate) fn misbehaving(&self, peer: NodeId, amount: u32, reason: &str) {
        self.registry.penalize(peer, amount, reason);
    }

    /// A new connection was established.
    pub async fn peer_connected(
        &self,
        id: NodeId,
        addr: IpAddr,
        kind: ConnectionKind,
        permissions: NetPermissions,
    ) {
        let now = self.now_ms();
        self.registry.register(id, addr, kind, permissions, now);
        let mut state = self.state.lock().await;
        state.register_peer(id);
        if kind.is_outbound_eviction_candidate() && state.try_new_outbound_peer {
            debug!("{}: extra outbound connected, clearing stale-tip request", id);
            state.try_new_outbound_peer = false;
        }
        info!("{} connected ({:?})", id, kind);
    }

    /// A connection closed; release everything it held.
    pub async fn peer_disconnected(&self, id: NodeId) {
        let mut state = self.state.lock().await;
        state.finalize_peer(id);
        drop(state);
        let score = self.registry.unregister(id);
        info!("{} disconnected (final misbehavior {:?})", id, score.unwrap_or(0));
    }

    /// Process one decoded message from a peer. Handler failures are
    /// logged and the peer continues, unless the handler already penalized
    /// or disconnected it.
    pub async fn handle_message(&self, id: NodeId, message: Message) {
        if !self.registry.contains(id) {
            return;
        }
        let command = message.command();
        if let Err(err) = self.dispatch(id, message).await {
            warn!("{}: error processing {}: {:#}", id, command, err);
        }
        self.disconnect_if_discouraged(id).await;
    }

    async fn dispatch(&self, id: NodeId, message: Message) -> Result<()> {
        match message {
            Message::Version(version) => self.handle_version(id, version).await,
            Message::Verack => self.handle_verack(id).await,
            Message::Ping(nonce) => {
                self.send(id, Message::Pong(nonce));
                Ok(())
            }
            Message::Pong(nonce) => self.handle_pong(id, nonce),
            Message::Addr(addrs) => self.handle_addr(id, addrs).await,
            Message::GetAddr => self.handle_getaddr(id).await,
            Message::SendHeaders => self.handle_sendheaders(id).await,
            Message::SendCmpct { announce, version } => {
                self.handle_sendcmpct(id, announce, version).await
            }
            Message::Inv(items) => self.handle_inv(id, items).await,
            Message::GetData(items) => self.handle_getdata(id, items).await,
            Message::NotFound(items) => self.handle_notfound(id, items).await,
            Message::GetHeaders { locator, stop } => {
                self.handle_getheaders(id, locator, stop).await
            }
            Message::Headers(headers) => self.handle_headers(id, headers).await,
            Message::Block(block) => self.handle_block(id, block).await,
            Message::Tx(tx) => self.handle_tx(id, tx).await,
            Message::CmpctBlock(cmpct) => self.handle_cmpct_block(id, cmpct).await,
            Message::GetBlockTxn(req) => self.handle_get_block_txn(id, req).await,
            Message::BlockTxn(txs) => self.handle_block_txn(id, txs).await,
            Message::Mempool => self.handle_mempool(id).await,
            Message::FeeFilter(rate) => self.handle_feefilter(id, rate),
            Message::FilterLoad { data, num_hashes, tweak } => {
                self.handle_filterload(id, data, num_hashes, tweak).await
            }
            Message::FilterAdd(data) => self.handle_filteradd(id, data).await,
            Message::FilterClear => self.handle_filterclear(id).await,
            Message::GetCfilters { filter_type, start_height, stop_hash } => {
                self.handle_getcfilters(id, filter_type, start_height, stop_hash).await
            }
            Message::GetCfheaders { filter_type, start_height, stop_hash } => {
                self.handle_getcfheaders(id, filter_type, start_height, stop_hash).await
            }
            Message::GetCfcheckpt { filter_type, stop_hash } => {
                self.handle_getcfcheckpt(id, filter_type, stop_hash).await
            }
            Message::Cfilter { .. } | Message::Cfheaders { .. } | Message::Cfcheckpt { .. } => {
                // We never request filters; unsolicited responses are noise.
                debug!("{}: ignoring unsolicited filter response", id);
                Ok(())
            }
            Message::Poll(poll) => self.handle_poll(id, poll).await,
            Message::PollResponse(response) => self.handle_poll_response(id, response).await,
        }
    }

    /// Consume the discouragement flag and act on it: exempt peers are
    /// forgiven with a log line, everyone else is discouraged by address
    /// and dropped.
    pub async fn disconnect_if_discouraged(&self, id: NodeId) -> bool {
        if !self.registry.take_should_discourage(id) {
            return false;
        }
        let Some((addr, kind, noban)) = self.registry.with_peer(id, |p| {
            (p.addr, p.kind, p.has_permission(NetPermissions::NO_BAN))
        }) else {
            return false;
        };
        if noban || matches!(kind, ConnectionKind::Manual) {
            warn!("{}: misbehavior past threshold on exempt peer, not disconnecting", id);
            return false;
        }
        if addr.is_loopback() {
            // Local peers are dropped but never discouraged: the address is
            // shared with every other local connection.
            warn!("{}: misbehavior past threshold on local peer, disconnecting", id);
            self.transport.disconnect(id);
            return true;
        }
        self.ban_store.discourage(addr);
        self.transport.disconnect(id);
        true
    }

    async fn handle_version(&self, id: NodeId, version: VersionMessage) -> Result<()> {
        let already = self
            .registry
            .with_peer(id, |p| p.version_received)
            .unwrap_or(false);
        if already {
            self.misbehaving(id, 1, "duplicate version message");
            return Ok(());
        }
        let blocks_only = self.config.blocks_only;
        let preferred = self
            .registry
            .with_peer_mut(id, |p| {
                p.version_received = true;
                p.services = version.services;
                p.version = version.version;
                p.start_height = version.start_height;
                p.relays_txs = version.relay
                    && (!blocks_only
                        || p.has_permission(NetPermissions::RELAY)
                        || p.has_permission(NetPermissions::FORCE_RELAY));
                p.is_preferred_download()
            })
            .unwrap_or(false);
        let mut state = self.state.lock().await;
        state.set_preferred_download(id, preferred);
        drop(state);
        self.send(id, Message::Verack);
        Ok(())
    }

    async fn handle_verack(&self, id: NodeId) -> Result<()> {
        let ok = self
            .registry
            .with_peer_mut(id, |p| {
                if !p.version_received {
                    return false;
                }
                p.handshake_complete = true;
                true
            })
            .unwrap_or(false);
        if !ok {
            self.misbehaving(id, 1, "verack before version");
            return Ok(());
        }
        // Ask for header announcements and offer low-bandwidth compact
        // block service.
        self.send(id, Message::SendHeaders);
        self.send(
            id,
            Message::SendCmpct {
                announce: false,
                version: CMPCTBLOCK_VERSION,
            },
        );
        Ok(())
    }

    fn handle_pong(&self, id: NodeId, nonce: u64) -> Result<()> {
        let now = self.now_ms();
        self.registry.with_peer_mut(id, |p| {
            if p.ping_nonce == Some(nonce) {
                let rtt = now.saturating_sub(p.ping_sent_at_ms);
                p.min_ping_ms = Some(p.min_ping_ms.map_or(rtt, |m| m.min(rtt)));
                p.ping_nonce = None;
            }
        });
        Ok(())
    }

    async fn handle_addr(&self, id: NodeId, addrs: Vec<NetAddress>) -> Result<()> {
        if addrs.len() > MAX_ADDR_TO_SEND {
            self.misbehaving(id, 20, "oversized addr message");
            bail!("addr message size = {}", addrs.len());
        }
        let block_relay_only = self
            .registry
            .with_peer(id, |p| matches!(p.kind, ConnectionKind::BlockRelayOnly))
            .unwrap_or(false);
        if block_relay_only {
            return Ok(());
        }
        let now = self.now_ms();
        let forward = addrs.len() <= 10;
        let mut state = self.state.lock().await;
        for addr in &addrs {
            if let Some(peer_state) = state.peer_mut(id) {
                peer_state.known_addrs.put(relay::addr_key(addr), ());
            }
            // Fresh, small announcements are forwarded to a couple of peers.
            if forward && addr.time * 1_000 + 10 * 60 * 1_000 > now {
                relay::relay_address(&mut state, id, *addr, now);
            }
            state.learned_addrs_push(*addr);
        }
        Ok(())
    }

    async fn handle_getaddr(&self, id: NodeId) -> Result<()> {
        let allowed = self
            .registry
            .with_peer_mut(id, |p| {
                if !matches!(p.kind, ConnectionKind::Inbound) || p.getaddr_answered {
                    false
                } else {
                    p.getaddr_answered = true;
                    true
                }
            })
            .unwrap_or(false);
        if !allowed {
            debug!("{}: ignoring repeated or outbound getaddr", id);
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let addrs = state.learned_addrs().to_vec();
        if let Some(peer_state) = state.peer_mut(id) {
            peer_state.addrs_to_send.extend(addrs);
            peer_state.addrs_to_send.truncate(MAX_ADDR_TO_SEND);
        }
        Ok(())
    }

    async fn handle_sendheaders(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(peer_state) = state.peer_mut(id) {
            peer_state.prefers_headers = true;
        }
        Ok(())
    }

    async fn handle_inv(&self, id: NodeId, items: Vec<InvItem>) -> Result<()> {
        if items.len() > MAX_INV_SIZE {
            self.misbehaving(id, 20, "oversized inv message");
            bail!("inv message size = {}", items.len());
        }
        let (inbound, relays) = self
            .registry
            .with_peer(id, |p| {
                (matches!(p.kind, ConnectionKind::Inbound), p.relays_txs)
            })
            .unwrap_or((true, false));
        let now = self.now_ms();
        let mut state = self.state.lock().await;
        let mut getheaders = None;
        {
            let chain = self.chain.read().unwrap();
            let best_header = chain.best_header();
            let mut last_unknown_block = None;
            for item in items {
                match item {
                    InvItem::Block(hash) | InvItem::CompactBlock(hash) => {
                        let have = chain.lookup(&hash).is_some();
                        state.update_block_availability(&chain, id, hash);
                        if !have && !self.is_importing() {
                            // Headers-first: announced blocks arrive via
                            // their headers. Remember the last unknown one;
                            // a single getheaders at the end covers them all.
                            last_unknown_block = Some(hash);
                        }
                    }
                    InvItem::Tx(txid) => {
                        if !relays && self.config.blocks_only {
                            debug!("{}: transaction inv in blocks-only mode", id);
                            continue;
                        }
                        if state.already_have_tx(&txid, &*self.mempool) || self.is_importing() {
                            continue;
                        }
                        let delay = tx_request::announcement_delay(inbound);
                        if let Some(peer_state) = state.peer_mut(id) {
                            peer_state.tx_download.queue_announcement(txid, now + delay);
                        }
                    }
                }
            }
            if let Some(hash) = last_unknown_block {
                debug!(
                    "getheaders ({}) to {} for inv {:?}",
                    chain.get(best_header).height,
                    id,
                    hash
                );
                getheaders = Some(Message::GetHeaders {
                    locator: chain.locator(best_header),
                    stop: hash,
                });
            }
        }
        drop(state);
        if let Some(message) = getheaders {
            self.send(id, message);
        }
        Ok(())
    }

    async fn handle_getdata(&self, id: NodeId, items: Vec<InvItem>) -> Result<()> {
        if items.len() > MAX_INV_SIZE {
            self.misbehaving(id, 20, "oversized getdata message");
            bail!("getdata message size = {}", items.len());
        }
        let mut not_found = Vec::new();
        for item in items {
            // Serving data can outlast a shutdown request; yield between
            // items rather than at message boundaries.
            if self.is_interrupted() {
                return Ok(());
            }
            match item {
                InvItem::Tx(txid) => {
                    let tx = {
                        let state = self.state.lock().await;
                        let announced = state
                            .peer(id)
                            .map(|p| p.recently_announced_txs.contains(&txid))
                            .unwrap_or(false);
                        if announced {
                            state.relay_cache.get(&txid).cloned()
                        } else {
                            None
                        }
                    };
                    match tx.or_else(|| self.mempool.get(&txid)) {
                        Some(tx) => self.send(id, Message::Tx(tx)),
                        None => not_found.push(item),
                    }
                }
                InvItem::Block(hash) => match self.block_store.get_block(&hash) {
                    Some(block) => self.send(id, Message::Block(block)),
                    None => not_found.push(item),
                },
                InvItem::CompactBlock(hash) => {
                    // Only recent blocks are worth compact service; older
                    // requests get the full block.
                    let recent = {
                        let chain = self.chain.read().unwrap();
                        chain
                            .lookup(&hash)
                            .map(|key| chain.get(key).height + 5 >= chain.height())
                            .unwrap_or(false)
                    };
                    let cached = {
                        let state = self.state.lock().await;
                        state
                            .most_recent_block
                            .as_ref()
                            .filter(|(h, _, _)| *h == hash)
                            .map(|(_, _, cmpct)| cmpct.clone())
                    };
                    if let Some(cmpct) = cached {
                        self.send(id, Message::CmpctBlock(cmpct));
                    } else {
                        match self.block_store.get_block(&hash) {
                            Some(block) if recent => {
                                let nonce = {
                                    let mut state = self.state.lock().await;
                                    rand::Rng::gen(&mut state.rng)
                                };
                                self.send(
                                    id,
                                    Message::CmpctBlock(CompactBlock::from_block(&block, nonce)),
                                );
                            }
                            Some(block) => self.send(id, Message::Block(block)),
                            None => not_found.push(item),
                        }
                    }
                }
            }
        }
        if !not_found.is_empty() {
            self.send(id, Message::NotFound(not_found));
        }
        Ok(())
    }

    async fn handle_notfound(&self, id: NodeId, items: Vec<InvItem>) -> Result<()> {
        let mut state = self.state.lock().await;
        for item in items {
            if let InvItem::Tx(txid) = item {
                let resolved = state
                    .peer_mut(id)
                    .map(|p| p.tx_download.resolve(&txid))
                    .unwrap_or(false);
                if resolved {
                    // Let another peer request it immediately.
                    state.tx_request_times.remove(&txid);
                }
            }
        }
        Ok(())
    }

    async fn handle_getheaders(
        &self,
        id: NodeId,
        locator: Vec<BlockHash>,
        stop: BlockHash,
    ) -> Result<()> {
        if locator.len() > 101 {
            self.misbehaving(id, 10, "oversized locator");
            bail!("locator size = {}", locator.len());
        }
        let noban = self
            .registry
            .with_peer(id, |p| p.has_permission(NetPermissions::NO_BAN))
            .unwrap_or(false);
        if self.consensus.is_initial_block_download() && !noban {
            debug!("ignoring getheaders from {} during initial sync", id);
            return Ok(());
        }
        let chain = self.chain.read().unwrap();
        let (headers, sent_tip) = if locator.is_empty() {
            // Single-block request by stop hash.
            match chain.lookup(&stop) {
                Some(key) => (vec![chain.get(key).header], Some(key)),
                None => return Ok(()),
            }
        } else {
            let fork = chain.find_fork_from_locator(&locator);
            let stop_opt = (stop != BlockHash::default()).then_some(&stop);
            let headers = chain.headers_after(fork, stop_opt, MAX_HEADERS_RESULTS);
            let last = headers.last().map(|h| h.hash()).and_then(|h| chain.lookup(&h));
            (headers, last)
        };
        drop(chain);
        let mut state = self.state.lock().await;
        if let (Some(peer_state), Some(key)) = (state.peer_mut(id), sent_tip) {
            peer_state.best_header_sent = Some(key);
        }
        drop(state);
        self.send(id, Message::Headers(headers));
        Ok(())
    }

    async fn handle_block(&self, id: NodeId, block: Block) -> Result<()> {
        let hash = block.header.hash();
        let now = self.now_ms();
        let forced = {
            let mut state = self.state.lock().await;
            let from_this_peer = state.block_in_flight_from(&hash) == Some(id);
            state.mark_block_as_received(&hash, now);
            // Unrequested blocks can still be processed, but their sender
            // is not punished if they prove invalid: the fault may be an
            // earlier relayer's.
            state.block_source.entry(hash).or_insert((id, from_this_peer));
            from_this_peer
        };
        let new_valid = self.consensus.process_block(&block, forced);
        if new_valid {
            let mut state = self.state.lock().await;
            state.block_source.remove(&hash);
        }
        Ok(())
    }

    async fn handle_tx(&self, id: NodeId, tx: Transaction) -> Result<()> {
        let relays = self.registry.with_peer(id, |p| p.relays_txs).unwrap_or(false);
        if self.config.blocks_only && !relays {
            debug!("{}: transaction sent in violation of protocol", id);
            return Ok(());
        }
        let txid = tx.txid();
        let now = self.now_ms();
        {
            let mut state = self.state.lock().await;
            if let Some(peer_state) = state.peer_mut(id) {
                peer_state.tx_download.resolve(&txid);
                peer_state.known_txs.put(txid, ());
            }
            state.tx_request_times.remove(&txid);
            if state.already_have_tx(&txid, &*self.mempool) {
                return Ok(());
            }
        }
        self.accept_and_relay_tx(id, tx, now).await;
        Ok(())
    }

    /// Run a transaction through validation, then drive any orphans that
    /// were waiting on it via an explicit work queue.
    async fn accept_and_relay_tx(&self, from: NodeId, tx: Transaction, now: u64) {
        let mut work: VecDeque<(NodeId, Transaction)> = VecDeque::new();
        work.push_back((from, tx));
        while let Some((source, tx)) = work.pop_front() {
            let txid = tx.txid();
            match self.consensus.accept_transaction(&tx) {
                TxValidationResult::Accepted => {
                    let mut state = self.state.lock().await;
                    debug!(
                        "AcceptToMemoryPool: {} accepted {:?} (poolsz {})",
                        source,
                        txid,
                        self.mempool.snapshot().len()
                    );
                    relay::relay_transaction(&mut state, txid);
                    state.cache_relay_tx(txid, tx.clone(), now);
                    for dep in state.orphans.dependents_of(&tx) {
                        if let Some((dep_tx, dep_from)) = state.orphans.get(&dep) {
                            work.push_back((dep_from, dep_tx.clone()));
                        }
                        state.orphans.erase(&dep);
                    }
                    state.orphans.erase(&txid);
                }
                TxValidationResult::MissingInputs(parents) => {
                    let inbound = self
                        .registry
                        .with_peer(source, |p| matches!(p.kind, ConnectionKind::Inbound))
                        .unwrap_or(true);
                    let mut state = self.state.lock().await;
                    // A rejected ancestor poisons the descendant; do not
                    // keep or re-request it.
                    let rejected_parent = parents
                        .iter()
                        .any(|p| state.recent_rejects.contains(&p.txid.0));
                    if rejected_parent {
                        debug!("not keeping orphan with rejected parents {:?}", txid);
                        state.recent_rejects.insert(&txid.0);
                        continue;
                    }
                    let delay = tx_request::announcement_delay(inbound);
                    for parent in &parents {
                        if let Some(peer_state) = state.peer_mut(source) {
                            peer_state
                                .tx_download
                                .queue_announcement(parent.txid, now + delay);
                        }
                    }
                    state.add_extra_txn(tx.clone(), self.config.max_extra_txn_for_reconstruction);
                    state.orphans.add(tx, source, now);
                    let max = self.config.max_orphan_transactions;
                    let state = &mut *state;
                    let (_, evicted) = state.orphans.limit(max, now, &mut state.rng);
                    if evicted > 0 {
                        debug!("orphanage overflow, removed {} tx", evicted);
                    }
                }
                TxValidationResult::Rejected(rejection) => {
                    let mut state = self.state.lock().await;
                    state.orphans.erase(&txid);
                    match rejection {
                        TxRejection::ProtocolViolation => {
                            state.recent_rejects.insert(&txid.0);
                            drop(state);
                            self.misbehaving(source, 100, "malformed transaction");
                        }
                        TxRejection::Consensus { penalty } => {
                            state.recent_rejects.insert(&txid.0);
                            drop(state);
                            self.misbehaving(source, penalty, "invalid transaction");
                        }
                        TxRejection::Policy => {
                            state.recent_rejects.insert(&txid.0);
                            state.add_extra_txn(
                                tx.clone(),
                                self.config.max_extra_txn_for_reconstruction,
                            );
                        }
                        TxRejection::Resource => {
                            // May be valid; allow a later retry.
                        }
                    }
                }
            }
        }
    }

    async fn handle_mempool(&self, id: NodeId) -> Result<()> {
        let allowed = self
            .registry
            .with_peer(id, |p| p.has_permission(NetPermissions::MEMPOOL))
            .unwrap_or(false);
        if !allowed {
            debug!("{}: mempool request refused, disconnecting", id);
            self.transport.disconnect(id);
            return Ok(());
        }
        let snapshot = self.mempool.snapshot();
        let mut state = self.state.lock().await;
        if let Some(peer_state) = state.peer_mut(id) {
            for entry in snapshot {
                peer_state.txs_for_inv_relay.push(entry.txid);
            }
        }
        Ok(())
    }

    fn handle_feefilter(&self, id: NodeId, rate: u64) -> Result<()> {
        self.registry.with_peer_mut(id, |p| p.fee_filter_received = rate);
        debug!("received: feefilter of {} from {}", rate, id);
        Ok(())
    }

    async fn handle_filterload(
        &self,
        id: NodeId,
        data: Vec<u8>,
        num_hashes: u32,
        tweak: u32,
    ) -> Result<()> {
        match PeerBloomFilter::from_load(data, num_hashes, tweak) {
            Some(filter) => {
                let mut state = self.state.lock().await;
                if let Some(peer_state) = state.peer_mut(id) {
                    peer_state.bloom_filter = Some(filter);
                }
                Ok(())
            }
            None => {
                self.misbehaving(id, 100, "oversized bloom filter");
                Ok(())
            }
        }
    }

    async fn handle_filteradd(&self, id: NodeId, data: Vec<u8>) -> Result<()> {
        if data.len() > MAX_FILTER_ADD_SIZE {
            self.misbehaving(id, 100, "oversized filteradd element");
            return Ok(());
        }
        let mut state = self.state.lock().await;
        match state.peer_mut(id).and_then(|p| p.bloom_filter.as_mut()) {
            Some(filter) => {
                filter.insert(&data);
                Ok(())
            }
            None => {
                drop(state);
                self.misbehaving(id, 100, "filteradd without loaded filter");
                Ok(())
            }
        }
    }

    async fn handle_filterclear(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(peer_state) = state.peer_mut(id) {
            peer_state.bloom_filter = None;
        }
        Ok(())
    }

    /// Validation callback: a block joined the active chain. Clears
    /// confirmed and conflicting transactions out of relay structures.
    pub async fn block_connected(&self, block: &Block) {
        let now = self.now_ms();
        let mut state = self.state.lock().await;
        state.last_tip_update_ms = now;
        for tx in &block.txs {
            let txid = tx.txid();
            state.recent_confirmed.insert(&txid.0);
            state.tx_request_times.remove(&txid);
            state.orphans.erase(&txid);
            // Orphans spending the same inputs are now conflicted.
            let conflicting: Vec<TxId> = tx
                .inputs
                .iter()
                .flat_map(|input| {
                    state
                        .orphans
                        .spenders_of(&input.prevout)
                        .into_iter()
                        .collect::<Vec<_>>()
                })
                .collect();
            for doomed in conflicting {
                state.orphans.erase(&doomed);
            }
        }
    }

    /// Validation callback: the active tip changed. Queues announcements
    /// and resets transaction reject tracking.
    pub async fn updated_block_tip(&self, new_tip: BlockHash, is_ibd: bool) {
        let chain = self.chain.read().unwrap();
        let Some(tip_key) = chain.lookup(&new_tip) else {
            return;
        };
        let mut to_announce = Vec::new();
        {
            // Announce the segment of the active chain since the last
            // announced tip each peer knows; peers resolve gaps themselves.
            let mut cur = Some(tip_key);
            while let Some(key) = cur {
                let rec = chain.get(key);
                to_announce.push(rec.hash);
                if to_announce.len() >= MAX_BLOCKS_TO_ANNOUNCE {
                    break;
                }
                cur = rec.parent;
            }
            to_announce.reverse();
        }
        drop(chain);
        let mut state = self.state.lock().await;
        state.last_tip_update_ms = self.now_ms();
        if state.rejects_reset_at != new_tip {
            state.rejects_reset_at = new_tip;
            state.recent_rejects.reset();
        }
        if !is_ibd {
            for id in state.peer_ids() {
                if let Some(peer_state) = state.peer_mut(id) {
                    for hash in &to_announce {
                        if !peer_state.blocks_to_announce.contains(hash) {
                            peer_state.blocks_to_announce.push(*hash);
                        }
                    }
                }
            }
        }
    }

    /// Validation callback: a block failed or passed final checks.
    pub async fn block_checked(&self, hash: BlockHash, penalty: Option<u32>) {
        let mut state = self.state.lock().await;
        let source = state.block_source.remove(&hash);
        match (penalty, source) {
            (Some(penalty), Some((peer, punish))) if penalty > 0 && punish => {
                drop(state);
                self.misbehaving(peer, penalty, "invalid block");
            }
            (None, Some((peer, _))) => {
                // Peer delivered the only outstanding copy of a valid
                // block; worth upgrading to compact announcements.
                if !self.consensus.is_initial_block_download()
                    && state.blocks_in_flight_count() == 0
                {
                    let provides = state.peer(peer).map(|p| p.provides_cmpct).unwrap_or(false);
                    if provides {
                        let demoted = state.add_compact_announcer(peer);
                        drop(state);
                        self.send(
                            peer,
                            Message::SendCmpct {
                                announce: true,
                                version: CMPCTBLOCK_VERSION,
                            },
                        );
                        for old in demoted {
                            self.send(
                                old,
                                Message::SendCmpct {
                                    announce: false,
                                    version: CMPCTBLOCK_VERSION,
                                },
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Send a keepalive ping when none is outstanding and the interval
    /// elapsed.
    fn maybe_ping(&self, id: NodeId, now: u64) {
        let nonce = self.registry.with_peer_mut(id, |p| {
            if p.ping_nonce.is_none() && now >= p.ping_sent_at_ms + PING_INTERVAL_MS {
                let nonce = now.wrapping_mul(0x9e37_79b9_7f4a_7c15).max(1);
                p.ping_nonce = Some(nonce);
                p.ping_sent_at_ms = now;
                Some(nonce)
            } else {
                None
            }
        });
        if let Some(Some(nonce)) = nonce {
            self.send(id, Message::Ping(nonce));
        }
    }

    /// One outbound cycle for a peer: discouragement, keepalive, sync
    /// start, announcements, trickles, request scheduling, and timeout
    /// enforcement.
    pub async fn send_messages(&self, id: NodeId) {
        let now = self.now_ms();
        if self.disconnect_if_discouraged(id).await {
            return;
        }
        let Some((handshake, kind)) = self
            .registry
            .with_peer(id, |p| (p.handshake_complete, p.kind))
        else {
            return;
        };
        if !handshake {
            return;
        }
        self.maybe_ping(id, now);
        relay::send_addr_trickle(self, id, now).await;
        header_sync::maybe_start_headers_sync(self, id, now).await;
        relay::announce_blocks(self, id, now).await;
        relay::send_tx_inventory(self, id, kind, now).await;
        eviction::enforce_download_timeouts(self, id, now).await;
        eviction::check_headers_sync_timeout(self, id, now).await;
        eviction::consider_eviction(self, id, now).await;
        block_download::request_blocks(self, id, now).await;
        block_download::request_transactions(self, id, now).await;
        relay::maybe_send_feefilter(self, id, now).await;
    }

    /// Whether stale-tip detection wants one extra outbound connection.
    /// The connection layer polls this after [`NetEngine::periodic_tick`].
    pub async fn needs_extra_outbound_peer(&self) -> bool {
        self.state.lock().await.try_new_outbound_peer
    }

    /// Periodic maintenance independent of any one peer.
    pub async fn periodic_tick(&self) {
        let now = self.now_ms();
        let next_extra = self.next_extra_peer_check_ms.load(Ordering::Relaxed);
        if now >= next_extra {
            self.next_extra_peer_check_ms
                .store(now + EXTRA_PEER_CHECK_INTERVAL_MS, Ordering::Relaxed);
            eviction::evict_extra_outbound_peers(self, now).await;
        }
        let next_stale = self.next_stale_check_ms.load(Ordering::Relaxed);
        if now >= next_stale {
            self.next_stale_check_ms
                .store(now + STALE_CHECK_INTERVAL_MS, Ordering::Relaxed);
            eviction::check_for_stale_tip(self, now).await;
        }
    }
}
