//! Misbehavior accounting and discouragement.

mod utils;

use std::net::{IpAddr, Ipv4Addr};
use sync_relay_node::network::peer::{ConnectionKind, NetPermissions};
use sync_relay_node::network::protocol::*;
use utils::Harness;

fn oversized_addr_batch() -> Vec<NetAddress> {
    (0..=MAX_ADDR_TO_SEND as u32)
        .map(|i| NetAddress {
            time: 1,
            services: 0,
            addr: IpAddr::V4(Ipv4Addr::new(10, (i >> 8) as u8, i as u8, 1)),
            port: 8333,
        })
        .collect()
}

#[tokio::test]
async fn test_repeated_violations_discourage_and_disconnect() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    // Five oversized addr messages at 20 points each cross the threshold.
    for _ in 0..5 {
        h.engine
            .handle_message(peer, Message::Addr(oversized_addr_batch()))
            .await;
    }
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
    assert_eq!(h.ban_store.discouraged_addrs().len(), 1);
}

#[tokio::test]
async fn test_violations_below_threshold_keep_the_peer() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    for _ in 0..4 {
        h.engine
            .handle_message(peer, Message::Addr(oversized_addr_batch()))
            .await;
    }
    assert!(h.transport.disconnected_peers().is_empty());
}

#[tokio::test]
async fn test_noban_peer_is_never_disconnected() {
    let h = Harness::new();
    let peer = h
        .connect_with(1, ConnectionKind::Inbound, NetPermissions::NO_BAN)
        .await;
    for _ in 0..10 {
        h.engine
            .handle_message(peer, Message::Addr(oversized_addr_batch()))
            .await;
    }
    assert!(h.transport.disconnected_peers().is_empty());
    assert!(h.ban_store.discouraged_addrs().is_empty());
}

#[tokio::test]
async fn test_local_peer_is_disconnected_but_not_discouraged() {
    let h = Harness::new();
    let peer = h
        .connect_from(
            1,
            ConnectionKind::Inbound,
            NetPermissions::empty(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
        .await;
    for _ in 0..5 {
        h.engine
            .handle_message(peer, Message::Addr(oversized_addr_batch()))
            .await;
    }
    // Discouraging 127.0.0.1 would hit every other local connection too.
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
    assert!(h.ban_store.discouraged_addrs().is_empty());
}

#[tokio::test]
async fn test_manual_peer_is_never_disconnected() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Manual).await;
    for _ in 0..5 {
        h.engine
            .handle_message(peer, Message::Addr(oversized_addr_batch()))
            .await;
    }
    assert!(h.transport.disconnected_peers().is_empty());
}

#[tokio::test]
async fn test_duplicate_version_messages_accumulate_slowly() {
    let h = Harness::new();
    let peer = h.connect(1, ConnectionKind::Inbound).await;
    let version = Message::Version(VersionMessage {
        version: 70016,
        services: SERVICE_NETWORK,
        timestamp: 0,
        user_agent: "/dup:0.1/".into(),
        start_height: 0,
        relay: true,
    });
    for _ in 0..99 {
        h.engine.handle_message(peer, version.clone()).await;
    }
    assert!(h.transport.disconnected_peers().is_empty());
    h.engine.handle_message(peer, version).await;
    assert_eq!(h.transport.disconnected_peers(), vec![peer]);
}
