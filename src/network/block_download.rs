//! Block download scheduling
//!
//! Picks which blocks to request from which peer. Downloads proceed along
//! the best known chain of each peer, constrained to a sliding window past
//! the last block we share with them, with one look-ahead slot past the
//! window to identify the peer stalling it.

use crate::chain::{BlockIndex, BlockKey};
use crate::network::protocol::{
    InvItem, Message, NodeId, BLOCK_DOWNLOAD_WINDOW, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
};
use crate::network::sync_state::SyncState;
use crate::network::{peer::ConnectionKind, NetEngine};
use tracing::debug;

/// Per-iteration batch size for the chain walk.
const WALK_BATCH: u32 = 128;
/// Blocks deeper than this below the tip need a full-chain peer.
const RECENT_BLOCK_SERVICE_DEPTH: u32 = 288;

impl SyncState {
    /// Select up to `count` blocks to request from `id`, following the
    /// peer's best known chain.
    ///
    /// Advances the peer's last-common-block pointer past segments that are
    /// already fully downloaded, skips blocks in flight elsewhere, and
    /// stops at the download window edge. When the window is exhausted and
    /// nothing was selected, the second return value names the peer whose
    /// outstanding request is blocking the window.
    pub fn find_next_blocks_to_download(
        &mut self,
        chain: &BlockIndex,
        id: NodeId,
        count: usize,
        min_chain_work: u128,
    ) -> (Vec<BlockKey>, Option<NodeId>) {
        if count == 0 {
            return (Vec::new(), None);
        }
        self.process_block_availability(chain, id);
        let Some(peer_state) = self.peer(id) else {
            return (Vec::new(), None);
        };
        let Some(best) = peer_state.best_known_block else {
            // This peer has nothing interesting.
            return (Vec::new(), None);
        };
        let best_rec = chain.get(best);
        if best_rec.work < chain.tip_record().work || best_rec.work < min_chain_work {
            return (Vec::new(), None);
        }

        let mut last_common = peer_state.last_common_block.unwrap_or_else(|| {
            // Bootstrap to our chain at the peer's height; guaranteed to
            // be at or below the true common block.
            let bootstrap = best_rec.height.min(chain.height());
            chain.active_at(bootstrap).unwrap_or_else(|| chain.genesis())
        });
        last_common = chain.last_common_ancestor(last_common, best);

        let mut results = Vec::new();
        let mut staller = None;
        if last_common != best {
            let window_end = chain.get(last_common).height + BLOCK_DOWNLOAD_WINDOW;
            let max_height = best_rec.height.min(window_end + 1);
            let mut walk = last_common;
            let mut waiting_for: Option<NodeId> = None;
            'walk: while chain.get(walk).height < max_height {
                // Pull a batch of successors along the peer's chain.
                let batch_end = (chain.get(walk).height + WALK_BATCH).min(max_height);
                let Some(top) = chain.ancestor_at(best, batch_end) else {
                    break;
                };
                let mut batch = Vec::new();
                let mut cur = top;
                while cur != walk {
                    batch.push(cur);
                    match chain.get(cur).parent {
                        Some(parent) => cur = parent,
                        None => break,
                    }
                }
                batch.reverse();
                walk = top;
                for key in batch {
                    let rec = chain.get(key);
                    if rec.has_data || chain.is_active(key) {
                        if rec.fully_linked {
                            last_common = key;
                        }
                    } else if self.block_in_flight_from(&rec.hash).is_none() {
                        if rec.height > window_end {
                            // Past the window. The single look-ahead slot
                            // identifies who is holding it up.
                            if results.is_empty() && waiting_for != Some(id) {
                                staller = waiting_for;
                            }
                            break 'walk;
                        }
                        results.push(key);
                        if results.len() == count {
                            break 'walk;
                        }
                    } else if waiting_for.is_none() {
                        waiting_for = self.block_in_flight_from(&rec.hash);
                    }
                }
            }
        }

        if let Some(peer_state) = self.peer_mut(id) {
            peer_state.last_common_block = Some(last_common);
        }
        (results, staller)
    }
}

/// Block-request timeout in milliseconds, scaling with how many peers are
/// already delivering validated blocks.
pub fn block_download_timeout_ms(block_interval_ms: u64, validated_peers: usize) -> u64 {
    use crate::network::protocol::{BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER};
    let factor = BLOCK_DOWNLOAD_TIMEOUT_BASE + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * validated_peers as f64;
    (block_interval_ms as f64 * factor) as u64
}

/// Fill the peer's block request pipeline during the send cycle.
pub(crate) async fn request_blocks(engine: &NetEngine, id: NodeId, now: u64) {
    if engine.is_importing() {
        return;
    }
    let Some((kind, serves_chain, serves_recent)) = engine.registry.with_peer(id, |p| {
        (p.kind, p.serves_full_chain(), p.serves_recent_blocks())
    }) else {
        return;
    };
    if !serves_recent {
        return;
    }
    let mut state = engine.state.lock().await;
    let Some(peer_state) = state.peer(id) else {
        return;
    };
    let can_fetch = peer_state.preferred_download
        || (state.preferred_download_count == 0 && !matches!(kind, ConnectionKind::Inbound));
    let slots = MAX_BLOCKS_IN_TRANSIT_PER_PEER.saturating_sub(peer_state.blocks_in_flight.len());
    if !can_fetch || slots == 0 {
        return;
    }
    let min_work = engine.consensus.minimum_chain_work();
    let chain = engine.chain.read().unwrap();
    let (to_download, staller) = state.find_next_blocks_to_download(&chain, id, slots, min_work);
    let mut items = Vec::new();
    for key in to_download {
        let rec = chain.get(key);
        if !serves_chain && rec.height + RECENT_BLOCK_SERVICE_DEPTH < chain.height() {
            continue;
        }
        state.mark_block_as_in_flight(id, rec.hash, Some(key), None, now);
        items.push(InvItem::Block(rec.hash));
        debug!("Requesting block {:?} ({}) peer={}", rec.hash, rec.height, id.0);
    }
    if let Some(staller) = staller {
        if let Some(staller_state) = state.peer_mut(staller) {
            if staller_state.stalling_since_ms == 0 {
                staller_state.stalling_since_ms = now;
                debug!("Stall started {}", staller);
            }
        }
    }
    drop(chain);
    drop(state);
    if !items.is_empty() {
        engine.send(id, Message::GetData(items));
    }
}

/// Drain due transaction announcements into a getdata during the send
/// cycle.
pub(crate) async fn request_transactions(engine: &NetEngine, id: NodeId, now: u64) {
    if engine.is_importing() {
        return;
    }
    let inbound = engine
        .registry
        .with_peer(id, |p| matches!(p.kind, ConnectionKind::Inbound))
        .unwrap_or(true);
    let mut state = engine.state.lock().await;
    let requests = state.drain_tx_requests(id, inbound, &*engine.mempool, now);
    drop(state);
    if !requests.is_empty() {
        engine.send(
            id,
            Message::GetData(requests.into_iter().map(InvItem::Tx).collect()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockIndex;
    use crate::network::protocol::{BlockHash, BlockHeader};

    fn header(parent: BlockHash, nonce: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: parent,
            merkle_root: [0; 32],
            time: 1_700_000_000 + nonce,
            bits: 0,
            nonce,
        }
    }

    fn chain_with(blocks: u32) -> (BlockIndex, Vec<BlockKey>) {
        let mut index = BlockIndex::new(header(BlockHash([0; 32]), 0));
        let mut keys = vec![index.genesis()];
        let mut tip = index.genesis();
        for i in 0..blocks {
            let h = header(index.get(tip).hash, i as u64 + 1);
            tip = index.insert(h, 2).unwrap();
            keys.push(tip);
        }
        (index, keys)
    }

    fn peer_knows_tip(state: &mut SyncState, chain: &BlockIndex, id: NodeId, tip: BlockKey) {
        state.register_peer(id);
        state.update_block_availability(chain, id, chain.get(tip).hash);
    }

    #[test]
    fn test_selects_successors_of_common_block_in_order() {
        let (chain, keys) = chain_with(50);
        let mut state = SyncState::new(0);
        peer_knows_tip(&mut state, &chain, NodeId(1), keys[50]);
        let (blocks, staller) =
            state.find_next_blocks_to_download(&chain, NodeId(1), 16, 0);
        assert!(staller.is_none());
        assert_eq!(blocks.len(), 16);
        assert_eq!(blocks[0], keys[1]);
        assert_eq!(blocks[15], keys[16]);
    }

    #[test]
    fn test_skips_blocks_in_flight_elsewhere() {
        let (chain, keys) = chain_with(20);
        let mut state = SyncState::new(0);
        peer_knows_tip(&mut state, &chain, NodeId(1), keys[20]);
        peer_knows_tip(&mut state, &chain, NodeId(2), keys[20]);
        let (first, _) = state.find_next_blocks_to_download(&chain, NodeId(1), 4, 0);
        for key in &first {
            state.mark_block_as_in_flight(NodeId(1), chain.get(*key).hash, Some(*key), None, 0);
        }
        let (second, _) = state.find_next_blocks_to_download(&chain, NodeId(2), 4, 0);
        assert_eq!(second[0], keys[5]);
        assert!(first.iter().all(|k| !second.contains(k)));
    }

    #[test]
    fn test_window_boundary_identifies_staller() {
        let (chain, keys) = chain_with(BLOCK_DOWNLOAD_WINDOW + 40);
        let mut state = SyncState::new(0);
        peer_knows_tip(&mut state, &chain, NodeId(1), *keys.last().unwrap());
        peer_knows_tip(&mut state, &chain, NodeId(2), *keys.last().unwrap());
        // Peer 1 claims the entire window.
        loop {
            let (blocks, _) = state.find_next_blocks_to_download(&chain, NodeId(1), usize::MAX, 0);
            if blocks.is_empty() {
                break;
            }
            for key in blocks {
                state.mark_block_as_in_flight(NodeId(1), chain.get(key).hash, Some(key), None, 0);
            }
        }
        assert_eq!(state.blocks_in_flight_count(), BLOCK_DOWNLOAD_WINDOW as usize);
        // Peer 2 finds nothing fetchable and names peer 1 as the staller.
        let (blocks, staller) = state.find_next_blocks_to_download(&chain, NodeId(2), 16, 0);
        assert!(blocks.is_empty());
        assert_eq!(staller, Some(NodeId(1)));
    }

    #[test]
    fn test_no_work_gate() {
        let (chain, keys) = chain_with(10);
        let mut state = SyncState::new(0);
        peer_knows_tip(&mut state, &chain, NodeId(1), keys[10]);
        let high_work = chain.get(keys[10]).work + 1;
        let (blocks, _) = state.find_next_blocks_to_download(&chain, NodeId(1), 16, high_work);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_last_common_advances_past_linked_blocks() {
        let (mut chain, keys) = chain_with(10);
        let mut state = SyncState::new(0);
        peer_knows_tip(&mut state, &chain, NodeId(1), keys[10]);
        for key in &keys[1..=4] {
            chain.mark_has_data(*key);
        }
        let (blocks, _) = state.find_next_blocks_to_download(&chain, NodeId(1), 3, 0);
        assert_eq!(blocks[0], keys[5]);
        assert_eq!(
            state.peer(NodeId(1)).unwrap().last_common_block,
            Some(keys[4])
        );
    }

    #[test]
    fn test_download_timeout_scales_with_validated_peers() {
        let base = block_download_timeout_ms(600_000, 0);
        let with_two = block_download_timeout_ms(600_000, 2);
        assert_eq!(base, 600_000);
        assert_eq!(with_two, 1_200_000);
    }
}
