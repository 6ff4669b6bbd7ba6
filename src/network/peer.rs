//! Per-connection peer records
//!
//! A `Peer` holds connection-scoped facts: direction, permissions,
//! handshake progress, and relay preferences negotiated during the
//! handshake. Chain-sync bookkeeping for the same peer lives in
//! `sync_state`, under the chain-state lock.

use bitflags::bitflags;
use std::net::IpAddr;

bitflags! {
    /// Permission flags granted to a connection by local configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetPermissions: u32 {
        /// Exempt from discouragement and disconnection for misbehavior.
        const NO_BAN = 1 << 0;
        /// Relay transactions even in blocks-only mode.
        const RELAY = 1 << 1;
        /// Always relay this peer's transactions, bypassing fee policy.
        const FORCE_RELAY = 1 << 2;
        /// Serve blocks without limit.
        const DOWNLOAD = 1 << 3;
        /// Answer mempool requests.
        const MEMPOOL = 1 << 4;
    }
}

/// How a connection was made and what it is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Inbound,
    /// Automatic outbound connection with full relay.
    OutboundFullRelay,
    /// Outbound connection that relays blocks only, no transactions or
    /// addresses.
    BlockRelayOnly,
    /// Operator-requested connection, never penalized or evicted.
    Manual,
    /// Short-lived address-gathering probe.
    Feeler,
}

impl ConnectionKind {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, ConnectionKind::Inbound)
    }

    /// Whether this connection counts toward chain-sync and extra-peer
    /// eviction logic.
    pub fn is_outbound_eviction_candidate(&self) -> bool {
        matches!(self, ConnectionKind::OutboundFullRelay)
    }
}

/// Connection-scoped peer state.
#[derive(Debug)]
pub struct Peer {
    pub id: crate::network::protocol::NodeId,
    pub addr: IpAddr,
    pub kind: ConnectionKind,
    pub permissions: NetPermissions,
    /// When the connection was established, engine clock.
    pub connected_at_ms: u64,

    /// Service bits from the version message.
    pub services: u64,
    pub version: u32,
    pub start_height: i32,
    pub version_received: bool,
    pub handshake_complete: bool,

    /// Peer asked for transaction relay in its version message.
    pub relays_txs: bool,
    /// Lowest fee rate (sat/kB) the peer wants announced, via feefilter.
    pub fee_filter_received: u64,

    /// Only one getaddr is answered per connection.
    pub getaddr_answered: bool,

    /// Outstanding ping nonce and send time, if any.
    pub ping_nonce: Option<u64>,
    pub ping_sent_at_ms: u64,
    /// Best measured round trip, for logging.
    pub min_ping_ms: Option<u64>,
}

impl Peer {
    pub fn new(
        id: crate::network::protocol::NodeId,
        addr: IpAddr,
        kind: ConnectionKind,
        permissions: NetPermissions,
        now_ms: u64,
    ) -> Self {
        Peer {
            id,
            addr,
            kind,
            permissions,
            connected_at_ms: now_ms,
            services: 0,
            version: 0,
            start_height: 0,
            version_received: false,
            handshake_complete: false,
            relays_txs: true,
            fee_filter_received: 0,
            getaddr_answered: false,
            ping_nonce: None,
            ping_sent_at_ms: 0,
            min_ping_ms: None,
        }
    }

    pub fn has_permission(&self, flag: NetPermissions) -> bool {
        self.permissions.contains(flag)
    }

    /// Peers we prefer to download blocks from: outbound or explicitly
    /// trusted, and advertising the chain.
    pub fn is_preferred_download(&self) -> bool {
        (self.kind.is_outbound() || self.has_permission(NetPermissions::NO_BAN))
            && !matches!(self.kind, ConnectionKind::Feeler)
            && self.services & crate::network::protocol::SERVICE_NETWORK != 0
    }

    /// Whether the peer can serve historical blocks.
    pub fn serves_full_chain(&self) -> bool {
        self.services & crate::network::protocol::SERVICE_NETWORK != 0
    }

    /// Whether the peer can serve at least recent blocks.
    pub fn serves_recent_blocks(&self) -> bool {
        self.serves_full_chain()
            || self.services & crate::network::protocol::SERVICE_NETWORK_LIMITED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{NodeId, SERVICE_NETWORK};
    use std::net::Ipv4Addr;

    fn peer(kind: ConnectionKind, permissions: NetPermissions) -> Peer {
        let mut p = Peer::new(
            NodeId(1),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            kind,
            permissions,
            0,
        );
        p.services = SERVICE_NETWORK;
        p
    }

    #[test]
    fn test_outbound_full_relay_is_preferred_download() {
        assert!(peer(ConnectionKind::OutboundFullRelay, NetPermissions::empty())
            .is_preferred_download());
        assert!(!peer(ConnectionKind::Inbound, NetPermissions::empty()).is_preferred_download());
        assert!(peer(ConnectionKind::Inbound, NetPermissions::NO_BAN).is_preferred_download());
        assert!(!peer(ConnectionKind::Feeler, NetPermissions::empty()).is_preferred_download());
    }

    #[test]
    fn test_eviction_candidate_kinds() {
        assert!(ConnectionKind::OutboundFullRelay.is_outbound_eviction_candidate());
        assert!(!ConnectionKind::Manual.is_outbound_eviction_candidate());
        assert!(!ConnectionKind::BlockRelayOnly.is_outbound_eviction_candidate());
        assert!(!ConnectionKind::Inbound.is_outbound_eviction_candidate());
    }
}
