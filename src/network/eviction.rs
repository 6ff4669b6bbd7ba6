//! Peer timeout and eviction enforcement
//!
//! Four separate mechanisms: stall and per-block download timeouts, the
//! initial headers-sync deadline, the chain-sync eviction of outbound
//! peers that never catch up to our work, and the periodic shedding of
//! extra outbound connections plus stale-tip detection.

use crate::network::block_download::block_download_timeout_ms;
use crate::network::peer::NetPermissions;
use crate::network::protocol::*;
use crate::network::NetEngine;
use tracing::{debug, info, warn};

/// Disconnect peers that stall the download window or sit on a block
/// request past its timeout.
pub(crate) async fn enforce_download_timeouts(engine: &NetEngine, id: NodeId, now: u64) {
    let state = engine.state.lock().await;
    let Some(peer_state) = state.peer(id) else {
        return;
    };
    let mut disconnect = false;
    if peer_state.stalling_since_ms > 0
        && now > peer_state.stalling_since_ms + BLOCK_STALLING_TIMEOUT_MS
    {
        // Everything else in the window arrived; only this peer's slots
        // are holding it closed.
        warn!("{} is stalling block download, disconnecting", id);
        disconnect = true;
    } else if let Some(front) = peer_state.blocks_in_flight.front() {
        let others = state.validated_download_peers
            - usize::from(peer_state.in_flight_valid_headers > 0);
        let timeout = block_download_timeout_ms(engine.config.target_block_interval_ms, others);
        if now > peer_state.downloading_since_ms + timeout {
            warn!(
                "Timeout downloading block {:?} from {}, disconnecting",
                front.hash, id
            );
            disconnect = true;
        }
    }
    drop(state);
    if disconnect {
        engine.transport.disconnect(id);
    }
}

/// Disconnect a sync peer that failed to deliver the headers chain within
/// its deadline during initial download.
pub(crate) async fn check_headers_sync_timeout(engine: &NetEngine, id: NodeId, now: u64) {
    let is_ibd = engine.consensus.is_initial_block_download();
    let noban = engine
        .registry
        .with_peer(id, |p| p.has_permission(NetPermissions::NO_BAN))
        .unwrap_or(false);
    let mut state = engine.state.lock().await;
    let expired = state
        .peer(id)
        .map(|p| p.sync_started && now > p.headers_sync_timeout_ms)
        .unwrap_or(false);
    if !expired {
        return;
    }
    if is_ibd && !noban {
        drop(state);
        info!("Timeout downloading headers from {}, disconnecting", id);
        engine.transport.disconnect(id);
        return;
    }
    // Give a protected peer a chance to catch up by other means, and
    // allow another peer to take over the sync slot.
    if let Some(peer_state) = state.peer_mut(id) {
        peer_state.sync_started = false;
        peer_state.headers_sync_timeout_ms = u64::MAX;
    }
    state.sync_started_count -= 1;
}

/// Chain-sync eviction for outbound peers.
///
/// An outbound peer whose best known block never reaches our tip's work
/// gets one warning getheaders after the timeout; failing to prove
/// knowledge of our chain within the response window disconnects it.
pub(crate) async fn consider_eviction(engine: &NetEngine, id: NodeId, now: u64) {
    let candidate = engine
        .registry
        .with_peer(id, |p| {
            p.handshake_complete && p.kind.is_outbound_eviction_candidate()
        })
        .unwrap_or(false);
    if !candidate {
        return;
    }
    let mut state = engine.state.lock().await;
    let chain = engine.chain.read().unwrap();
    let tip = chain.tip();
    let tip_work = chain.tip_record().work;
    let Some(peer_state) = state.peer_mut(id) else {
        return;
    };
    if peer_state.chain_sync.protect {
        return;
    }
    let caught_up = peer_state
        .best_known_block
        .map(|key| chain.get(key).work >= tip_work)
        .unwrap_or(false);
    let tip_advanced = peer_state
        .chain_sync
        .work_at
        .map(|key| chain.get(key).work < tip_work)
        .unwrap_or(false);

    let mut to_send = None;
    let mut disconnect = false;
    if caught_up {
        peer_state.chain_sync = Default::default();
    } else if peer_state.chain_sync.timeout_at_ms == 0 || tip_advanced {
        // (Re)arm against the current tip.
        peer_state.chain_sync.timeout_at_ms = now + CHAIN_SYNC_TIMEOUT_MS;
        peer_state.chain_sync.work_at = Some(tip);
        peer_state.chain_sync.sent_getheaders = false;
    } else if now > peer_state.chain_sync.timeout_at_ms {
        if peer_state.chain_sync.sent_getheaders {
            info!(
                "Disconnecting outbound peer {} for old chain, best known block = {:?}",
                id,
                peer_state.best_known_block.map(|k| chain.get(k).hash)
            );
            disconnect = true;
        } else {
            debug!(
                "sending getheaders to outbound peer={} to verify chain work",
                id.0
            );
            peer_state.chain_sync.sent_getheaders = true;
            peer_state.chain_sync.timeout_at_ms = now + HEADERS_RESPONSE_TIME_MS;
            let from = chain
                .get(tip)
                .parent
                .unwrap_or(tip);
            to_send = Some(Message::GetHeaders {
                locator: chain.locator(from),
                stop: BlockHash::default(),
            });
        }
    }
    drop(chain);
    drop(state);
    if let Some(message) = to_send {
        engine.send(id, message);
    }
    if disconnect {
        engine.transport.disconnect(id);
    }
}

/// When carrying more full-relay outbound peers than configured, drop the
/// one with the least recent block announcement.
pub(crate) async fn evict_extra_outbound_peers(engine: &NetEngine, now: u64) {
    let mut candidates = Vec::new();
    for id in engine.registry.peer_ids() {
        let eligible = engine
            .registry
            .with_peer(id, |p| {
                p.handshake_complete
                    && p.kind.is_outbound_eviction_candidate()
                    && now >= p.connected_at_ms + MINIMUM_CONNECT_TIME_MS
            })
            .unwrap_or(false);
        if engine
            .registry
            .with_peer(id, |p| p.kind.is_outbound_eviction_candidate())
            .unwrap_or(false)
        {
            candidates.push((id, eligible));
        }
    }
    if candidates.len() <= engine.config.max_outbound_full_relay {
        return;
    }
    let state = engine.state.lock().await;
    // Youngest announcement wins; ties go against the newer connection.
    let mut worst: Option<(u64, NodeId)> = None;
    for (id, eligible) in candidates {
        if !eligible {
            continue;
        }
        let Some(peer_state) = state.peer(id) else {
            continue;
        };
        if peer_state.chain_sync.protect {
            continue;
        }
        let announced = peer_state.last_block_announcement_ms;
        let replace = match worst {
            None => true,
            Some((best_announced, best_id)) => {
                announced < best_announced || (announced == best_announced && id.0 > best_id.0)
            }
        };
        if replace {
            worst = Some((announced, id));
        }
    }
    let Some((announced, victim)) = worst else {
        return;
    };
    let in_flight_empty = state
        .peer(victim)
        .map(|p| p.blocks_in_flight.is_empty())
        .unwrap_or(false);
    drop(state);
    if in_flight_empty {
        info!(
            "disconnecting extra outbound peer={} (last block announcement received at time {})",
            victim.0, announced
        );
        engine.transport.disconnect(victim);
    } else {
        debug!(
            "keeping outbound peer={} chosen for eviction (last block announcement received at time {})",
            victim.0, announced
        );
    }
}

/// Flag a stale tip so the connection layer opens one extra outbound peer.
pub(crate) async fn check_for_stale_tip(engine: &NetEngine, now: u64) {
    let threshold = engine.config.stale_tip_threshold_ms();
    let mut state = engine.state.lock().await;
    if state.tip_may_be_stale(threshold, now) {
        if !state.try_new_outbound_peer {
            warn!(
                "Potential stale tip detected, will try using extra outbound peer (last tip update: {} ms ago)",
                now.saturating_sub(state.last_tip_update_ms)
            );
            state.try_new_outbound_peer = true;
        }
    } else if state.try_new_outbound_peer {
        state.try_new_outbound_peer = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sync_state::SyncState;

    #[test]
    fn test_chain_sync_default_is_unarmed() {
        let mut state = SyncState::new(0);
        state.register_peer(NodeId(1));
        let peer_state = state.peer(NodeId(1)).unwrap();
        assert_eq!(peer_state.chain_sync.timeout_at_ms, 0);
        assert!(!peer_state.chain_sync.sent_getheaders);
        assert!(!peer_state.chain_sync.protect);
    }

    #[test]
    fn test_stalling_window_is_two_seconds() {
        assert_eq!(BLOCK_STALLING_TIMEOUT_MS, 2_000);
        assert_eq!(CHAIN_SYNC_TIMEOUT_MS, 20 * 60 * 1_000);
        assert_eq!(HEADERS_RESPONSE_TIME_MS, 2 * 60 * 1_000);
    }
}
