//! Peer registry and misbehavior scoring
//!
//! Owns the connection-scoped `Peer` records and each peer's misbehavior
//! score under a dedicated lock, so score updates from any message handler
//! never contend with chain-state work. The discouragement decision is a
//! sticky flag consumed once per outbound cycle.

use crate::network::peer::{ConnectionKind, NetPermissions, Peer};
use crate::network::protocol::NodeId;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, warn};

struct PeerEntry {
    peer: Peer,
    misbehavior_score: u32,
    /// Set when the score crosses the threshold; cleared when acted on.
    should_discourage: bool,
}

/// Registry of connected peers.
pub struct PeerRegistry {
    entries: Mutex<HashMap<NodeId, PeerEntry>>,
    threshold: u32,
}

impl PeerRegistry {
    pub fn new(threshold: u32) -> Self {
        PeerRegistry {
            entries: Mutex::new(HashMap::new()),
            threshold,
        }
    }

    pub fn register(
        &self,
        id: NodeId,
        addr: IpAddr,
        kind: ConnectionKind,
        permissions: NetPermissions,
        now_ms: u64,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id,
            PeerEntry {
                peer: Peer::new(id, addr, kind, permissions, now_ms),
                misbehavior_score: 0,
                should_discourage: false,
            },
        );
    }

    /// Remove the peer, returning its final misbehavior score.
    pub fn unregister(&self, id: NodeId) -> Option<u32> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&id).map(|e| e.misbehavior_score)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Read a snapshot of connection-scoped facts under the lock.
    pub fn with_peer<R>(&self, id: NodeId, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|e| f(&e.peer))
    }

    /// Mutate a peer record under the lock.
    pub fn with_peer_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&id).map(|e| f(&mut e.peer))
    }

    /// All connected peer ids. Callers iterate over this snapshot instead
    /// of holding the registry lock across per-peer work.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    /// Add misbehavior score to a peer. Crossing the threshold marks the
    /// peer for discouragement.
    pub fn penalize(&self, id: NodeId, amount: u32, reason: &str) {
        if amount == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        let before = entry.misbehavior_score;
        entry.misbehavior_score = before.saturating_add(amount);
        if before < self.threshold && entry.misbehavior_score >= self.threshold {
            entry.should_discourage = true;
            warn!(
                "{}: misbehavior {} -> {} threshold exceeded ({})",
                id, before, entry.misbehavior_score, reason
            );
        } else {
            debug!(
                "{}: misbehavior {} -> {} ({})",
                id, before, entry.misbehavior_score, reason
            );
        }
    }

    pub fn misbehavior_score(&self, id: NodeId) -> u32 {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|e| e.misbehavior_score).unwrap_or(0)
    }

    /// Consume the discouragement flag. Returns true at most once per
    /// threshold crossing.
    pub fn take_should_discourage(&self, id: NodeId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.should_discourage => {
                entry.should_discourage = false;
                true
            }
            _ => false,
        }
    }
}
