//! Announcement scheduling
//!
//! Block announcements go out immediately, as headers or compact blocks
//! when the peer can connect them, as inv otherwise. Transaction and
//! address announcements trickle on Poisson-spaced timers so that message
//! timing leaks nothing about when we first saw an item.

use crate::mempool::MempoolEntry;
use crate::network::peer::ConnectionKind;
use crate::network::protocol::*;
use crate::network::sync_state::SyncState;
use crate::network::NetEngine;
use crate::utils::poisson_next_send;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Identity of an address for known-address tracking and relay selection.
pub(crate) fn addr_key(addr: &NetAddress) -> u64 {
    let mut hasher = DefaultHasher::new();
    addr.addr.hash(&mut hasher);
    addr.port.hash(&mut hasher);
    hasher.finish()
}

/// Forward a freshly learned address to two peers, chosen by a hash that is
/// stable for a day so repeated announcements of one address converge on
/// the same relayers.
pub(crate) fn relay_address(state: &mut SyncState, from: NodeId, addr: NetAddress, now_ms: u64) {
    let key = addr_key(&addr);
    let day = now_ms / (24 * 60 * 60 * 1_000);
    let mut best: [(u64, Option<NodeId>); 2] = [(0, None), (0, None)];
    for id in state.peer_ids() {
        if id == from {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        (key, day, id.0).hash(&mut hasher);
        let score = hasher.finish();
        if score > best[0].0 {
            best[1] = best[0];
            best[0] = (score, Some(id));
        } else if score > best[1].0 {
            best[1] = (score, Some(id));
        }
    }
    for (_, chosen) in best {
        let Some(id) = chosen else { continue };
        if let Some(peer_state) = state.peer_mut(id) {
            if peer_state.known_addrs.contains(&key) {
                continue;
            }
            peer_state.addrs_to_send.push(addr);
        }
    }
}

/// Queue a newly accepted transaction for announcement to every peer that
/// does not already know it.
pub(crate) fn relay_transaction(state: &mut SyncState, txid: TxId) {
    for id in state.peer_ids() {
        if let Some(peer_state) = state.peer_mut(id) {
            if peer_state.known_txs.contains(&txid) {
                continue;
            }
            peer_state.txs_for_inv_relay.push(txid);
        }
    }
}

/// Flush the peer's pending addresses when its trickle timer fires.
pub(crate) async fn send_addr_trickle(engine: &NetEngine, id: NodeId, now: u64) {
    let mut state = engine.state.lock().await;
    let next = poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL_MS, &mut state.rng);
    let Some(peer_state) = state.peer_mut(id) else {
        return;
    };
    if now < peer_state.next_addr_send_ms || peer_state.addrs_to_send.is_empty() {
        return;
    }
    peer_state.next_addr_send_ms = next;
    let pending = std::mem::take(&mut peer_state.addrs_to_send);
    let mut to_send = Vec::new();
    for addr in pending {
        let key = addr_key(&addr);
        if peer_state.known_addrs.contains(&key) {
            continue;
        }
        peer_state.known_addrs.put(key, ());
        to_send.push(addr);
        if to_send.len() == MAX_ADDR_TO_SEND {
            break;
        }
    }
    drop(state);
    if !to_send.is_empty() {
        engine.send(id, Message::Addr(to_send));
    }
}

/// Announce queued blocks to one peer.
///
/// Headers are preferred when the peer asked for them and every queued
/// block still sits on the active chain connecting to what the peer has;
/// a sole new block goes out as a compact block to peers that asked for
/// that. Anything else falls back to an inv of the newest queued block.
pub(crate) async fn announce_blocks(engine: &NetEngine, id: NodeId, _now: u64) {
    let mut state = engine.state.lock().await;
    let chain = engine.chain.read().unwrap();
    let Some((prefers_headers, prefers_cmpct, best_header_sent)) = state
        .peer(id)
        .map(|p| (p.prefers_headers, p.prefers_cmpct, p.best_header_sent))
    else {
        return;
    };
    let queued = state
        .peer_mut(id)
        .map(|p| std::mem::take(&mut p.blocks_to_announce))
        .unwrap_or_default();
    if queued.is_empty() {
        return;
    }

    let mut revert_to_inv = !prefers_headers;
    let mut headers: Vec<BlockHeader> = Vec::new();
    let mut best = best_header_sent;
    if !revert_to_inv {
        for hash in &queued {
            let Some(key) = chain.lookup(hash) else {
                revert_to_inv = true;
                break;
            };
            if !chain.is_active(key) {
                // Reorged away since it was queued.
                revert_to_inv = true;
                break;
            }
            let known = state.peer_has_block(&chain, id, key);
            let connects = match chain.get(key).parent {
                None => true,
                Some(parent) => {
                    best == Some(parent) || state.peer_has_block(&chain, id, parent)
                }
            };
            if !known && !connects {
                // The peer could not attach this header; inv lets it pull
                // the chain itself.
                revert_to_inv = true;
                break;
            }
            if !known {
                headers.push(chain.get(key).header);
            }
            best = Some(key);
        }
    }

    let mut message = None;
    if !revert_to_inv {
        if headers.len() == 1 && prefers_cmpct {
            let hash = headers[0].hash();
            let cached = state
                .most_recent_block
                .as_ref()
                .filter(|(h, _, _)| *h == hash)
                .map(|(_, _, cmpct)| cmpct.clone());
            let cmpct = cached.or_else(|| {
                let nonce = rand::Rng::gen(&mut state.rng);
                engine
                    .block_store
                    .get_block(&hash)
                    .map(|block| CompactBlock::from_block(&block, nonce))
            });
            message = match cmpct {
                Some(cmpct) => {
                    debug!("sending header-and-ids {:?} to {}", hash, id);
                    Some(Message::CmpctBlock(cmpct))
                }
                None => Some(Message::Headers(headers)),
            };
        } else if !headers.is_empty() {
            debug!("sending {} headers to {}", headers.len(), id);
            message = Some(Message::Headers(headers));
        }
        if let Some(peer_state) = state.peer_mut(id) {
            peer_state.best_header_sent = best;
        }
    } else {
        // Newest queued block still on the active chain, if any.
        let fallback = queued.iter().rev().find(|hash| {
            chain
                .lookup(hash)
                .map(|key| chain.is_active(key))
                .unwrap_or(false)
        });
        if let Some(hash) = fallback {
            debug!("announcing block {:?} to {} via inv", hash, id);
            if let Some(peer_state) = state.peer_mut(id) {
                peer_state.blocks_for_inv_relay.push(*hash);
            }
        }
    }
    drop(chain);
    drop(state);
    if let Some(message) = message {
        engine.send(id, message);
    }
}

/// Send pending inventory to one peer: block invs immediately, transaction
/// invs on the trickle timer, ordered parents-first then by fee rate,
/// filtered by the peer's feefilter and bloom filter.
pub(crate) async fn send_tx_inventory(
    engine: &NetEngine,
    id: NodeId,
    kind: ConnectionKind,
    now: u64,
) {
    let Some((fee_filter, relays)) = engine
        .registry
        .with_peer(id, |p| (p.fee_filter_received, p.relays_txs))
    else {
        return;
    };
    let mut state = engine.state.lock().await;
    // Outbound peers trickle twice as fast; there are fewer of them, and
    // this keeps network-wide propagation speed up.
    let interval = if matches!(kind, ConnectionKind::Inbound) {
        INVENTORY_BROADCAST_INTERVAL_MS
    } else {
        INVENTORY_BROADCAST_INTERVAL_MS / 2
    };
    let next = poisson_next_send(now, interval, &mut state.rng);
    let Some(peer_state) = state.peer_mut(id) else {
        return;
    };
    let mut items: Vec<InvItem> = peer_state
        .blocks_for_inv_relay
        .drain(..)
        .map(InvItem::Block)
        .collect();

    if now >= peer_state.next_inv_send_ms {
        peer_state.next_inv_send_ms = next;
        if relays && !peer_state.txs_for_inv_relay.is_empty() {
            let mut queued = std::mem::take(&mut peer_state.txs_for_inv_relay);
            let info: HashMap<TxId, MempoolEntry> = engine
                .mempool
                .snapshot()
                .into_iter()
                .map(|e| (e.txid, e))
                .collect();
            // Entries gone from the pool are dropped silently.
            queued.retain(|txid| info.contains_key(txid));
            queued.sort_by(|a, b| {
                let (ea, eb) = (&info[a], &info[b]);
                ea.depth.cmp(&eb.depth).then(eb.fee_rate.cmp(&ea.fee_rate))
            });
            let mut sent = 0;
            let mut rest = Vec::new();
            for txid in queued {
                if sent == INVENTORY_BROADCAST_MAX {
                    rest.push(txid);
                    continue;
                }
                if peer_state.known_txs.contains(&txid) {
                    continue;
                }
                if info[&txid].fee_rate < fee_filter {
                    continue;
                }
                if let Some(filter) = &peer_state.bloom_filter {
                    if !filter.contains(&txid.0) {
                        continue;
                    }
                }
                peer_state.known_txs.put(txid, ());
                peer_state.recently_announced_txs.put(txid, ());
                items.push(InvItem::Tx(txid));
                sent += 1;
            }
            peer_state.txs_for_inv_relay = rest;
        }
    }
    drop(state);
    if !items.is_empty() {
        engine.send(id, Message::Inv(items));
    }
}

/// Tell the peer our mempool's minimum fee rate when it changed, on a slow
/// Poisson timer.
pub(crate) async fn maybe_send_feefilter(engine: &NetEngine, id: NodeId, now: u64) {
    if engine.config.blocks_only {
        return;
    }
    let relays = engine
        .registry
        .with_peer(id, |p| p.relays_txs)
        .unwrap_or(false);
    if !relays {
        return;
    }
    let min_fee = engine.mempool.min_fee_rate();
    let mut state = engine.state.lock().await;
    let next = poisson_next_send(now, AVG_FEEFILTER_BROADCAST_INTERVAL_MS, &mut state.rng);
    let Some(peer_state) = state.peer_mut(id) else {
        return;
    };
    if now < peer_state.next_feefilter_send_ms {
        return;
    }
    peer_state.next_feefilter_send_ms = next;
    if min_fee == peer_state.last_sent_feefilter {
        return;
    }
    peer_state.last_sent_feefilter = min_fee;
    drop(state);
    debug!("sending feefilter of {} to {}", min_fee, id);
    engine.send(id, Message::FeeFilter(min_fee));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_transaction_skips_peers_that_know_it() {
        let mut state = SyncState::new(0);
        state.register_peer(NodeId(1));
        state.register_peer(NodeId(2));
        let txid = TxId([7; 32]);
        state.peer_mut(NodeId(1)).unwrap().known_txs.put(txid, ());
        relay_transaction(&mut state, txid);
        assert!(state.peer(NodeId(1)).unwrap().txs_for_inv_relay.is_empty());
        assert_eq!(state.peer(NodeId(2)).unwrap().txs_for_inv_relay, vec![txid]);
    }

    #[test]
    fn test_relay_address_picks_at_most_two_peers() {
        let mut state = SyncState::new(0);
        for i in 0..6 {
            state.register_peer(NodeId(i));
        }
        let addr = NetAddress {
            time: 1,
            services: 0,
            addr: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)),
            port: 8333,
        };
        relay_address(&mut state, NodeId(0), addr, 1_000);
        let receivers: usize = state
            .peer_ids()
            .into_iter()
            .filter(|id| !state.peer(*id).unwrap().addrs_to_send.is_empty())
            .count();
        assert_eq!(receivers, 2);
        assert!(state.peer(NodeId(0)).unwrap().addrs_to_send.is_empty());
    }

    #[test]
    fn test_relay_address_selection_is_stable_within_a_day() {
        let pick = |now: u64| {
            let mut state = SyncState::new(0);
            for i in 0..6 {
                state.register_peer(NodeId(i));
            }
            let addr = NetAddress {
                time: 1,
                services: 0,
                addr: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2)),
                port: 8333,
            };
            relay_address(&mut state, NodeId(5), addr, now);
            let mut ids: Vec<u64> = state
                .peer_ids()
                .into_iter()
                .filter(|id| !state.peer(*id).unwrap().addrs_to_send.is_empty())
                .map(|id| id.0)
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(pick(10_000), pick(20_000));
    }
}
