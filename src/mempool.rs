//! Mempool view consumed by the relay layer
//!
//! The engine never mutates the mempool directly; acceptance goes through
//! [`crate::interfaces::Consensus`]. This module defines the read view the
//! relay and compact-block code need, plus a simple in-memory
//! implementation used by embedders and tests.

use crate::network::protocol::{Transaction, TxId};
use std::collections::HashMap;
use std::sync::RwLock;

/// One mempool transaction as seen by the relay layer.
#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: TxId,
    pub tx: Transaction,
    /// Fee rate in sat/kB, used to order announcements.
    pub fee_rate: u64,
    /// Number of unconfirmed ancestors; parents relay before children.
    pub depth: u32,
}

/// Read access to the mempool.
pub trait MempoolView: Send + Sync {
    fn contains(&self, txid: &TxId) -> bool;
    fn get(&self, txid: &TxId) -> Option<Transaction>;
    /// All entries; callers order and filter as needed.
    fn snapshot(&self) -> Vec<MempoolEntry>;
    /// Current minimum fee rate for acceptance, in sat/kB.
    fn min_fee_rate(&self) -> u64;
}

/// In-memory mempool.
pub struct Mempool {
    entries: RwLock<HashMap<TxId, MempoolEntry>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, tx: Transaction, fee_rate: u64, depth: u32) {
        let txid = tx.txid();
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            txid,
            MempoolEntry {
                txid,
                tx,
                fee_rate,
                depth,
            },
        );
    }

    pub fn remove(&self, txid: &TxId) -> Option<Transaction> {
        self.entries.write().unwrap().remove(txid).map(|e| e.tx)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl MempoolView for Mempool {
    fn contains(&self, txid: &TxId) -> bool {
        self.entries.read().unwrap().contains_key(txid)
    }

    fn get(&self, txid: &TxId) -> Option<Transaction> {
        self.entries.read().unwrap().get(txid).map(|e| e.tx.clone())
    }

    fn snapshot(&self) -> Vec<MempoolEntry> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    fn min_fee_rate(&self) -> u64 {
        1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{OutPoint, TxIn, TxOut};

    fn tx(n: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: TxId([n; 32]),
                    index: 0,
                },
            }],
            outputs: vec![TxOut { value: 1 }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let pool = Mempool::new();
        let t = tx(1);
        let id = t.txid();
        pool.insert(t.clone(), 5_000, 0);
        assert!(pool.contains(&id));
        assert_eq!(pool.get(&id), Some(t));
        assert_eq!(pool.remove(&id).map(|t| t.txid()), Some(id));
        assert!(!pool.contains(&id));
    }

    #[test]
    fn test_snapshot_carries_ordering_metadata() {
        let pool = Mempool::new();
        pool.insert(tx(1), 10_000, 0);
        pool.insert(tx(2), 2_000, 1);
        let snap = pool.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().any(|e| e.fee_rate == 10_000 && e.depth == 0));
    }
}
