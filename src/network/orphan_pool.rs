//! Orphan transaction pool
//!
//! Transactions whose inputs are unknown wait here for their parents. The
//! pool is bounded: entries expire in batched sweeps, and past the size
//! limit random entries are evicted. A by-prevout index lets parent
//! acceptance re-drive dependent orphans without scanning the pool.

use crate::network::protocol::{
    NodeId, OutPoint, Transaction, TxId, ORPHAN_TX_EXPIRE_INTERVAL_MS, ORPHAN_TX_EXPIRE_TIME_MS,
};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Orphans above this size are not kept; a cheap way to fill the pool.
const MAX_ORPHAN_TX_SIZE: usize = 100_000;

struct OrphanEntry {
    tx: Transaction,
    from: NodeId,
    expires_at_ms: u64,
}

/// Bounded pool of transactions waiting for missing parents.
pub struct OrphanPool {
    entries: HashMap<TxId, OrphanEntry>,
    by_prevout: HashMap<OutPoint, HashSet<TxId>>,
    /// Earliest time the next expiry sweep will run.
    next_sweep_ms: u64,
}

impl OrphanPool {
    pub fn new() -> Self {
        OrphanPool {
            entries: HashMap::new(),
            by_prevout: HashMap::new(),
            next_sweep_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &TxId) -> Option<(&Transaction, NodeId)> {
        self.entries.get(txid).map(|e| (&e.tx, e.from))
    }

    /// Add an orphan. Returns false for duplicates and oversize
    /// transactions.
    pub fn add(&mut self, tx: Transaction, from: NodeId, now_ms: u64) -> bool {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return false;
        }
        if tx.size() > MAX_ORPHAN_TX_SIZE {
            debug!("ignoring large orphan tx (size {}) {:?}", tx.size(), txid);
            return false;
        }
        for input in &tx.inputs {
            self.by_prevout
                .entry(input.prevout)
                .or_default()
                .insert(txid);
        }
        self.entries.insert(
            txid,
            OrphanEntry {
                tx,
                from,
                expires_at_ms: now_ms + ORPHAN_TX_EXPIRE_TIME_MS,
            },
        );
        debug!(
            "stored orphan tx {:?} (mapsz {} outsz {})",
            txid,
            self.entries.len(),
            self.by_prevout.len()
        );
        true
    }

    /// Remove one orphan. Returns 1 if it was present.
    pub fn erase(&mut self, txid: &TxId) -> usize {
        let Some(entry) = self.entries.remove(txid) else {
            return 0;
        };
        for input in &entry.tx.inputs {
            if let Some(set) = self.by_prevout.get_mut(&input.prevout) {
                set.remove(txid);
                if set.is_empty() {
                    self.by_prevout.remove(&input.prevout);
                }
            }
        }
        1
    }

    /// Remove all orphans received from a disconnecting peer.
    pub fn erase_for_peer(&mut self, peer: NodeId) -> usize {
        let doomed: Vec<TxId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.from == peer)
            .map(|(id, _)| *id)
            .collect();
        let mut erased = 0;
        for txid in doomed {
            erased += self.erase(&txid);
        }
        if erased > 0 {
            debug!("erased {} orphan tx from {}", erased, peer);
        }
        erased
    }

    /// Enforce the size limit: first sweep expired entries (at most once
    /// per sweep interval), then evict random entries until under the
    /// limit. Returns (expired, evicted).
    pub fn limit(&mut self, max_orphans: usize, now_ms: u64, rng: &mut impl Rng) -> (usize, usize) {
        let mut expired = 0;
        if now_ms >= self.next_sweep_ms {
            let doomed: Vec<TxId> = self
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at_ms <= now_ms)
                .map(|(id, _)| *id)
                .collect();
            let mut min_expiry = u64::MAX;
            for txid in doomed {
                expired += self.erase(&txid);
            }
            for entry in self.entries.values() {
                min_expiry = min_expiry.min(entry.expires_at_ms);
            }
            // Sweep again when the now-earliest entry could expire, but not
            // more often than the sweep interval.
            self.next_sweep_ms = if min_expiry == u64::MAX {
                now_ms + ORPHAN_TX_EXPIRE_INTERVAL_MS
            } else {
                min_expiry.max(now_ms + ORPHAN_TX_EXPIRE_INTERVAL_MS)
            };
            if expired > 0 {
                debug!("erased {} orphan tx due to expiration", expired);
            }
        }
        let mut evicted = 0;
        while self.entries.len() > max_orphans {
            let victim = {
                let idx = rng.gen_range(0..self.entries.len());
                *self.entries.keys().nth(idx).unwrap()
            };
            self.erase(&victim);
            evicted += 1;
        }
        (expired, evicted)
    }

    /// Orphans spending a specific outpoint.
    pub fn spenders_of(&self, prevout: &OutPoint) -> Vec<TxId> {
        self.by_prevout
            .get(prevout)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Orphans that spend outputs of `tx`, candidates for revalidation
    /// once `tx` is accepted.
    pub fn dependents_of(&self, tx: &Transaction) -> Vec<TxId> {
        let txid = tx.txid();
        let mut out = Vec::new();
        for index in 0..tx.outputs.len() as u32 {
            if let Some(set) = self.by_prevout.get(&OutPoint { txid, index }) {
                out.extend(set.iter().copied());
            }
        }
        out
    }
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{TxIn, TxOut};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn orphan_spending(parent: TxId, index: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: parent,
                    index,
                },
            }],
            outputs: vec![TxOut { value: 1 }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_add_and_erase_maintains_prevout_index() {
        let mut pool = OrphanPool::new();
        let parent = TxId([1; 32]);
        let orphan = orphan_spending(parent, 0);
        let txid = orphan.txid();
        assert!(pool.add(orphan.clone(), NodeId(1), 0));
        assert!(!pool.add(orphan, NodeId(1), 0));
        assert!(pool.contains(&txid));
        assert_eq!(pool.erase(&txid), 1);
        assert_eq!(pool.erase(&txid), 0);
        assert!(pool.by_prevout.is_empty());
    }

    #[test]
    fn test_erase_for_peer_only_hits_that_peer() {
        let mut pool = OrphanPool::new();
        pool.add(orphan_spending(TxId([1; 32]), 0), NodeId(1), 0);
        pool.add(orphan_spending(TxId([2; 32]), 0), NodeId(2), 0);
        assert_eq!(pool.erase_for_peer(NodeId(1)), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_limit_evicts_down_to_max() {
        let mut pool = OrphanPool::new();
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..50u8 {
            pool.add(orphan_spending(TxId([i; 32]), 0), NodeId(1), 0);
        }
        let (_, evicted) = pool.limit(40, 0, &mut rng);
        assert_eq!(evicted, 10);
        assert_eq!(pool.len(), 40);
    }

    #[test]
    fn test_limit_expires_old_entries_in_batches() {
        let mut pool = OrphanPool::new();
        let mut rng = StdRng::seed_from_u64(6);
        pool.add(orphan_spending(TxId([1; 32]), 0), NodeId(1), 0);
        pool.add(
            orphan_spending(TxId([2; 32]), 0),
            NodeId(1),
            ORPHAN_TX_EXPIRE_TIME_MS / 2,
        );
        // First sweep after the first entry's lifetime: only it expires.
        let (expired, _) = pool.limit(100, ORPHAN_TX_EXPIRE_TIME_MS + 1, &mut rng);
        assert_eq!(expired, 1);
        assert_eq!(pool.len(), 1);
        // Sweep throttling: an immediate second call does nothing even
        // though time passed.
        let (expired, _) = pool.limit(100, ORPHAN_TX_EXPIRE_TIME_MS + 2, &mut rng);
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_dependents_of_accepted_parent() {
        let mut pool = OrphanPool::new();
        let parent = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: TxId([9; 32]),
                    index: 0,
                },
            }],
            outputs: vec![TxOut { value: 1 }, TxOut { value: 2 }],
            lock_time: 0,
        };
        let child0 = orphan_spending(parent.txid(), 0);
        let child1 = orphan_spending(parent.txid(), 1);
        let unrelated = orphan_spending(TxId([8; 32]), 0);
        pool.add(child0.clone(), NodeId(1), 0);
        pool.add(child1.clone(), NodeId(2), 0);
        pool.add(unrelated, NodeId(3), 0);
        let mut deps = pool.dependents_of(&parent);
        deps.sort();
        let mut expected = vec![child0.txid(), child1.txid()];
        expected.sort();
        assert_eq!(deps, expected);
    }
}
