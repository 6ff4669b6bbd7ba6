//! Windowed block download scheduling against a syncing peer.

mod utils;

use sync_relay_node::network::peer::ConnectionKind;
use sync_relay_node::network::protocol::*;
use utils::{block_with, coinbase, header_chain, Harness};

fn getdata_blocks(messages: &[Message]) -> Vec<BlockHash> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::GetData(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
        .filter_map(|item| match item {
            InvItem::Block(hash) => Some(hash),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_requests_a_full_pipeline_in_chain_order() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 30, 1);
    let hashes: Vec<BlockHash> = batch.iter().map(|b| b.hash()).collect();
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    h.transport.take_sent();
    h.engine.send_messages(peer).await;
    let requested = getdata_blocks(&h.transport.sent_to(peer));
    assert_eq!(requested.len(), MAX_BLOCKS_IN_TRANSIT_PER_PEER);
    assert_eq!(requested[..], hashes[..MAX_BLOCKS_IN_TRANSIT_PER_PEER]);
}

#[tokio::test]
async fn test_pipeline_refills_as_blocks_arrive() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 30, 1);
    h.engine
        .handle_message(peer, Message::Headers(batch.clone()))
        .await;
    h.engine.send_messages(peer).await;
    h.transport.take_sent();

    let block = block_with(batch[0], vec![coinbase(0)]);
    let hash = block.header.hash();
    h.engine.handle_message(peer, Message::Block(block)).await;
    assert_eq!(
        h.consensus.accepted_blocks.lock().unwrap().as_slice(),
        &[hash]
    );
    // One slot opened; the next unrequested block fills it.
    h.engine.send_messages(peer).await;
    let refill = getdata_blocks(&h.transport.sent_to(peer));
    assert_eq!(refill, vec![batch[MAX_BLOCKS_IN_TRANSIT_PER_PEER].hash()]);
}

#[tokio::test]
async fn test_block_download_timeout_disconnects_the_peer() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 30, 1);
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    h.engine.send_messages(peer).await;
    assert!(h.transport.disconnected_peers().is_empty());
    // Base timeout is one target interval when no other peer is delivering
    // validated blocks.
    h.advance(600_001);
    h.engine.send_messages(peer).await;
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
}

#[tokio::test]
async fn test_inbound_peer_is_not_used_while_a_preferred_peer_exists() {
    let h = Harness::new();
    let outbound = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let inbound = h.connect(2, ConnectionKind::Inbound).await;
    let batch = header_chain(h.genesis_hash(), 30, 1);
    h.engine
        .handle_message(inbound, Message::Headers(batch))
        .await;
    h.transport.take_sent();
    h.engine.send_messages(inbound).await;
    assert!(getdata_blocks(&h.transport.sent_to(inbound)).is_empty());
    // The preferred outbound peer picks the same chain up instead.
    h.engine
        .handle_message(outbound, Message::Headers(header_chain(h.genesis_hash(), 30, 1)))
        .await;
    h.transport.take_sent();
    h.engine.send_messages(outbound).await;
    assert_eq!(
        getdata_blocks(&h.transport.sent_to(outbound)).len(),
        MAX_BLOCKS_IN_TRANSIT_PER_PEER
    );
}

#[tokio::test]
async fn test_interrupt_stops_getdata_service_between_items() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    let block = block_with(header_chain(h.genesis_hash(), 1, 7)[0], vec![coinbase(0)]);
    let hash = block.header.hash();
    h.store.put(block);
    h.engine
        .handle_message(peer, Message::GetData(vec![InvItem::Block(hash)]))
        .await;
    assert!(h
        .transport
        .sent_to(peer)
        .iter()
        .any(|m| matches!(m, Message::Block(b) if b.header.hash() == hash)));
    h.transport.take_sent();
    // Shutdown was requested; the same getdata now goes unanswered, with
    // no notfound either.
    h.engine.interrupt();
    h.engine
        .handle_message(peer, Message::GetData(vec![InvItem::Block(hash)]))
        .await;
    assert!(h.transport.sent_to(peer).is_empty());
}

#[tokio::test]
async fn test_blocks_already_in_flight_are_not_rerequested() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::OutboundFullRelay).await;
    let batch = header_chain(h.genesis_hash(), 10, 1);
    h.engine.handle_message(peer, Message::Headers(batch)).await;
    h.transport.take_sent();
    h.engine.send_messages(peer).await;
    let first = getdata_blocks(&h.transport.sent_to(peer));
    assert_eq!(first.len(), 10);
    h.transport.take_sent();
    h.engine.send_messages(peer).await;
    assert!(getdata_blocks(&h.transport.sent_to(peer)).is_empty());
}
