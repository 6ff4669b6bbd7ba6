//! Headers message processing and initial headers sync
//!
//! Headers drive everything else: they establish what each peer has,
//! trigger direct block fetch near the tip, arm eviction protection for
//! well-synced outbound peers, and page the initial sync forward one
//! getheaders at a time.

use crate::network::peer::{ConnectionKind, NetPermissions};
use crate::network::protocol::*;
use crate::network::NetEngine;
use anyhow::{bail, Result};
use tracing::{debug, info};

/// Direct fetch is only worthwhile when our tip is recent; this many
/// target intervals is the cutoff.
const DIRECT_FETCH_TIP_AGE_INTERVALS: u64 = 20;

impl NetEngine {
    pub(crate) async fn handle_headers(&self, id: NodeId, headers: Vec<BlockHeader>) -> Result<()> {
        if headers.len() > MAX_HEADERS_RESULTS {
            self.misbehaving(id, 20, "too many headers");
            bail!("headers message size = {}", headers.len());
        }
        if headers.is_empty() {
            // An empty reply means the peer has nothing past our locator.
            return Ok(());
        }
        for pair in headers.windows(2) {
            if pair[1].prev_hash != pair[0].hash() {
                self.misbehaving(id, 20, "non-continuous headers sequence");
                bail!("non-continuous headers");
            }
        }
        let now = self.now_ms();
        let last_hash = headers[headers.len() - 1].hash();

        // Unconnecting headers: we cannot attach this batch anywhere. Ask
        // for headers from our best known point instead, and penalize
        // peers that keep doing it.
        {
            let mut state = self.state.lock().await;
            let chain = self.chain.read().unwrap();
            let connects = chain.lookup(&headers[0].prev_hash).is_some();
            if !connects && headers.len() < MAX_BLOCKS_TO_ANNOUNCE {
                let best_header = chain.best_header();
                let locator = chain.locator(best_header);
                let count = state
                    .peer_mut(id)
                    .map(|p| {
                        p.unconnecting_headers += 1;
                        p.unconnecting_headers
                    })
                    .unwrap_or(0);
                debug!(
                    "received header {:?}: missing prev block {:?}, sending getheaders ({}) to {} (unconnecting {})",
                    last_hash,
                    headers[0].prev_hash,
                    chain.get(best_header).height,
                    id,
                    count
                );
                state.update_block_availability(&chain, id, last_hash);
                drop(chain);
                drop(state);
                self.send(
                    id,
                    Message::GetHeaders {
                        locator,
                        stop: BlockHash::default(),
                    },
                );
                if count % MAX_UNCONNECTING_HEADERS == 0 {
                    self.misbehaving(id, 20, "repeated unconnecting headers");
                }
                return Ok(());
            }
        }

        let received_new_header = {
            let chain = self.chain.read().unwrap();
            chain.lookup(&last_hash).is_none()
        };

        let last_key = match self.consensus.process_headers(&headers) {
            Ok(key) => key,
            Err(err) => {
                self.misbehaving(id, err.penalty, &err.reason);
                bail!("invalid header from {}: {}", id, err.reason);
            }
        };

        let (kind, noban) = self
            .registry
            .with_peer(id, |p| (p.kind, p.has_permission(NetPermissions::NO_BAN)))
            .unwrap_or((ConnectionKind::Inbound, false));
        let is_ibd = self.consensus.is_initial_block_download();
        let min_work = self.consensus.minimum_chain_work();

        let mut to_send = Vec::new();
        let mut disconnect = false;
        {
            let mut state = self.state.lock().await;
            let chain = self.chain.read().unwrap();
            if let Some(peer_state) = state.peer_mut(id) {
                if peer_state.unconnecting_headers > 0 {
                    debug!(
                        "{}: resetting unconnecting_headers ({} -> 0)",
                        id, peer_state.unconnecting_headers
                    );
                    peer_state.unconnecting_headers = 0;
                }
                if received_new_header {
                    peer_state.last_block_announcement_ms = now;
                }
            }
            state.update_block_availability(&chain, id, last_hash);

            if headers.len() == MAX_HEADERS_RESULTS {
                // The peer likely has more; page forward.
                debug!(
                    "more getheaders ({}) to end to {} (startheight {})",
                    chain.get(last_key).height,
                    id,
                    chain.get(last_key).height
                );
                to_send.push(Message::GetHeaders {
                    locator: chain.locator(last_key),
                    stop: BlockHash::default(),
                });
            }

            // Direct fetch: a short announcement extending a chain with
            // more work than our tip, while our tip is fresh.
            let tip_fresh = chain.tip_record().time_ms()
                + DIRECT_FETCH_TIP_AGE_INTERVALS * self.config.target_block_interval_ms
                > now;
            let more_work = chain.get(last_key).work > chain.tip_record().work;
            if tip_fresh && more_work && headers.len() <= MAX_BLOCKS_TO_ANNOUNCE {
                let mut to_fetch = Vec::new();
                let mut walk = Some(last_key);
                let mut oversized = false;
                while let Some(key) = walk {
                    let rec = chain.get(key);
                    if rec.has_data || chain.is_active(key) {
                        break;
                    }
                    if state.block_in_flight_from(&rec.hash).is_none() {
                        to_fetch.push(key);
                    }
                    if to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                        oversized = true;
                        break;
                    }
                    walk = rec.parent;
                }
                if oversized {
                    debug!(
                        "Large reorg, won't direct fetch to {:?} ({})",
                        chain.get(last_key).hash,
                        chain.get(last_key).height
                    );
                } else if !to_fetch.is_empty() {
                    to_fetch.reverse();
                    let provides_cmpct = state
                        .peer(id)
                        .map(|p| p.provides_cmpct)
                        .unwrap_or(false);
                    let mut items = Vec::new();
                    for key in &to_fetch {
                        let rec = chain.get(*key);
                        let in_flight = state
                            .peer(id)
                            .map(|p| p.blocks_in_flight.len())
                            .unwrap_or(0);
                        if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                            break;
                        }
                        let hash = rec.hash;
                        state.mark_block_as_in_flight(id, hash, Some(*key), None, now);
                        // A sole new block from a compact-capable peer is
                        // fetched compactly.
                        if items.is_empty() && to_fetch.len() == 1 && provides_cmpct {
                            items.push(InvItem::CompactBlock(hash));
                        } else {
                            items.push(InvItem::Block(hash));
                        }
                        debug!("Requesting block {:?} from {}", hash, id);
                    }
                    if !items.is_empty() {
                        info!(
                            "Downloading blocks toward {:?} ({}) via headers direct fetch",
                            chain.get(last_key).hash,
                            chain.get(last_key).height
                        );
                        to_send.push(Message::GetData(items));
                    }
                }
            }

            // Outbound peer management keyed off what this batch proved.
            if kind.is_outbound_eviction_candidate() {
                let best_known_work = state
                    .peer(id)
                    .and_then(|p| p.best_known_block)
                    .map(|k| chain.get(k).work);
                if is_ibd && headers.len() != MAX_HEADERS_RESULTS {
                    // Final batch during initial sync: judge the chain.
                    if best_known_work.map(|w| w < min_work).unwrap_or(true) && !noban {
                        info!("Disconnecting outbound peer {} -- headers chain has insufficient work", id);
                        disconnect = true;
                    }
                }
                if !state
                    .peer(id)
                    .map(|p| p.chain_sync.protect)
                    .unwrap_or(true)
                    && best_known_work
                        .map(|w| w >= chain.tip_record().work)
                        .unwrap_or(false)
                    && state.protected_outbound_count < MAX_OUTBOUND_PEERS_TO_PROTECT
                {
                    debug!("Protecting outbound peer {} from eviction", id);
                    state.protected_outbound_count += 1;
                    if let Some(peer_state) = state.peer_mut(id) {
                        peer_state.chain_sync.protect = true;
                    }
                }
            }
        }
        for message in to_send {
            self.send(id, message);
        }
        if disconnect {
            self.transport.disconnect(id);
        }
        Ok(())
    }
}

/// Kick off headers sync with this peer if it is time. Only one peer syncs
/// us at once while we are catching up; once the best header is within a
/// day of now, redundant sync peers are cheap and allowed.
pub(crate) async fn maybe_start_headers_sync(engine: &NetEngine, id: NodeId, now: u64) {
    if engine.is_importing() {
        return;
    }
    let Some((serves, preferred_kind)) = engine
        .registry
        .with_peer(id, |p| (p.serves_recent_blocks(), p.is_preferred_download()))
    else {
        return;
    };
    if !serves {
        return;
    }
    let mut state = engine.state.lock().await;
    let already = state.peer(id).map(|p| p.sync_started).unwrap_or(true);
    if already {
        return;
    }
    let chain = engine.chain.read().unwrap();
    let best_header = chain.best_header();
    let best_header_time = chain.get(best_header).time_ms();
    let recent = best_header_time + 24 * 60 * 60 * 1_000 > now;
    if !(state.sync_started_count == 0 && preferred_kind) && !recent {
        return;
    }
    let expected_headers =
        now.saturating_sub(best_header_time) / engine.config.target_block_interval_ms.max(1);
    // Start one block back so a peer on the same tip still answers with
    // the tip header and the sync machinery sees progress.
    let from = chain.get(best_header).parent.unwrap_or(best_header);
    let locator = chain.locator(from);
    let height = chain.get(best_header).height;
    drop(chain);
    let started = state
        .peer_mut(id)
        .map(|peer_state| {
            peer_state.sync_started = true;
            peer_state.headers_sync_timeout_ms = now
                + HEADERS_DOWNLOAD_TIMEOUT_BASE_MS
                + HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER_MS * expected_headers;
            true
        })
        .unwrap_or(false);
    if started {
        state.sync_started_count += 1;
        drop(state);
        debug!("initial getheaders ({}) to {}", height, id);
        engine.send(
            id,
            Message::GetHeaders {
                locator,
                stop: BlockHash::default(),
            },
        );
    }
}
