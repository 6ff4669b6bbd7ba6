//! Headers sync: initial sync start, paging, unconnecting penalties, and
//! direct fetch of freshly announced blocks.

mod utils;

use sync_relay_node::network::peer::ConnectionKind;
use sync_relay_node::network::protocol::*;
use utils::{header, header_chain, Harness};

fn getheaders_sent(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, Message::GetHeaders { .. }))
        .count()
}

#[tokio::test]
async fn test_old_best_header_keeps_sync_on_a_single_peer() {
    let h = Harness::new();
    // More than a day behind: redundant sync peers would each pull the
    // whole chain, so only the first preferred peer gets the slot.
    h.advance(25 * 60 * 60 * 1_000);
    let first = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let second = h.connect(2, ConnectionKind::OutboundFullRelay).await;
    h.engine.send_messages(first).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(first)), 1);
    h.transport.take_sent();
    h.engine.send_messages(second).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(second)), 0);
}

#[tokio::test]
async fn test_recent_best_header_allows_redundant_sync_peers() {
    let h = Harness::new();
    let first = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let second = h.connect(2, ConnectionKind::OutboundFullRelay).await;
    h.engine.send_messages(first).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(first)), 1);
    h.transport.take_sent();
    // Near the tip a second sync peer costs little and guards against a
    // stalling first one.
    h.engine.send_messages(second).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(second)), 1);
}

#[tokio::test]
async fn test_full_headers_batch_pages_forward() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), MAX_HEADERS_RESULTS, 1);
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(peer)), 1);
}

#[tokio::test]
async fn test_short_final_batch_does_not_page() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 100, 1);
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    assert_eq!(getheaders_sent(&h.transport.sent_to(peer)), 0);
}

#[tokio::test]
async fn test_unconnecting_headers_trigger_getheaders_and_eventual_discouragement() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    for i in 0..50u64 {
        let orphan = header(BlockHash([0xAA; 32]), 100 + i);
        h.engine
            .handle_message(peer, Message::Headers(vec![orphan]))
            .await;
    }
    // Every batch asked for our headers back.
    assert_eq!(getheaders_sent(&h.transport.sent_to(peer)), 50);
    // Every tenth batch scored 20; the fiftieth crossed the threshold.
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
}

#[tokio::test]
async fn test_connecting_headers_reset_the_unconnecting_counter() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    for round in 0..20u64 {
        // Nine unconnecting batches, then one that connects.
        for i in 0..9u64 {
            let orphan = header(BlockHash([0xBB; 32]), round * 100 + i + 1_000_000);
            h.engine
                .handle_message(peer, Message::Headers(vec![orphan]))
                .await;
        }
        let good = header_chain(h.genesis_hash(), 1, round + 2);
        h.engine.handle_message(peer, Message::Headers(good)).await;
    }
    assert!(h.transport.disconnected_peers().is_empty());
}

#[tokio::test]
async fn test_short_fresh_announcement_is_fetched_directly() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 2, 3);
    let hashes: Vec<BlockHash> = batch.iter().map(|b| b.hash()).collect();
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    let getdata: Vec<Vec<InvItem>> = h
        .transport
        .sent_to(peer)
        .into_iter()
        .filter_map(|m| match m {
            Message::GetData(items) => Some(items),
            _ => None,
        })
        .collect();
    assert_eq!(getdata.len(), 1);
    assert_eq!(
        getdata[0],
        vec![InvItem::Block(hashes[0]), InvItem::Block(hashes[1])]
    );
}

#[tokio::test]
async fn test_sole_new_block_is_fetched_compactly_from_capable_peer() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    h.engine
        .handle_message(
            peer,
            Message::SendCmpct {
                announce: false,
                version: CMPCTBLOCK_VERSION,
            },
        )
        .await;
    let batch = header_chain(h.genesis_hash(), 1, 4);
    let hash = batch[0].hash();
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    let compact_requests: Vec<Message> = h
        .transport
        .sent_to(peer)
        .into_iter()
        .filter(|m| {
            matches!(m, Message::GetData(items) if items == &vec![InvItem::CompactBlock(hash)])
        })
        .collect();
    assert_eq!(compact_requests.len(), 1);
}

#[tokio::test]
async fn test_outbound_peer_with_insufficient_work_chain_is_dropped_during_initial_sync() {
    let h = Harness::new();
    h.consensus
        .ibd
        .store(true, std::sync::atomic::Ordering::Relaxed);
    *h.consensus.min_work.lock().unwrap() = 1 << 40;
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 3, 5);
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
}
