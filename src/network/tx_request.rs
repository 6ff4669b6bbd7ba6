//! Transaction request scheduling
//!
//! Each peer gets a bounded announcement queue and in-flight set. A global
//! request-time map ensures one transaction is only requested from one peer
//! per interval; announcements from inbound peers are delayed so outbound
//! peers get first shot, and deferred retries carry random jitter so peers
//! cannot predict request order.

use crate::network::protocol::{
    TxId, GETDATA_TX_INTERVAL_MS, INBOUND_PEER_TX_DELAY_MS, MAX_GETDATA_RANDOM_DELAY_MS,
    MAX_PEER_TX_ANNOUNCEMENTS, MAX_PEER_TX_IN_FLIGHT, TX_EXPIRY_INTERVAL_FACTOR,
};
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Per-peer transaction download state.
pub struct TxDownloadState {
    /// Everything announced and not yet resolved, bounding total memory.
    announced: HashSet<TxId>,
    /// Announcements ordered by the time they become requestable.
    process_queue: BTreeSet<(u64, TxId)>,
    /// Outstanding requests and when they were sent.
    in_flight: HashMap<TxId, u64>,
}

impl TxDownloadState {
    pub fn new() -> Self {
        TxDownloadState {
            announced: HashSet::new(),
            process_queue: BTreeSet::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_count(&self) -> usize {
        self.process_queue.len()
    }

    pub fn is_announced(&self, txid: &TxId) -> bool {
        self.announced.contains(txid)
    }

    /// Record an announcement, to be processed at `process_at_ms`. Ignored
    /// when already tracked or when the peer is over its announcement cap.
    pub fn queue_announcement(&mut self, txid: TxId, process_at_ms: u64) -> bool {
        if self.announced.contains(&txid) || self.announced.len() >= MAX_PEER_TX_ANNOUNCEMENTS {
            return false;
        }
        self.announced.insert(txid);
        self.process_queue.insert((process_at_ms, txid));
        true
    }

    fn pop_due(&mut self, now_ms: u64) -> Option<TxId> {
        let &(at, txid) = self.process_queue.iter().next()?;
        if at > now_ms {
            return None;
        }
        self.process_queue.remove(&(at, txid));
        Some(txid)
    }

    fn requeue(&mut self, txid: TxId, at_ms: u64) {
        self.process_queue.insert((at_ms, txid));
    }

    /// Resolve a transaction: received, included in a block, or announced
    /// as not found. Frees the announcement slot.
    pub fn resolve(&mut self, txid: &TxId) -> bool {
        self.in_flight.remove(txid);
        self.announced.remove(txid)
    }

    /// Drop in-flight requests old enough to be considered lost, freeing
    /// their announcement slots.
    fn expire_in_flight(&mut self, now_ms: u64) -> Vec<TxId> {
        let cutoff = now_ms.saturating_sub(GETDATA_TX_INTERVAL_MS * TX_EXPIRY_INTERVAL_FACTOR);
        let expired: Vec<TxId> = self
            .in_flight
            .iter()
            .filter(|(_, &sent)| sent <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for txid in &expired {
            self.in_flight.remove(txid);
            self.announced.remove(txid);
        }
        expired
    }
}

impl Default for TxDownloadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before an inbound peer's announcement becomes requestable.
pub fn announcement_delay(is_inbound: bool) -> u64 {
    if is_inbound {
        INBOUND_PEER_TX_DELAY_MS
    } else {
        0
    }
}

/// Drain due announcements for one peer into a getdata batch.
///
/// `already_requested` maps txid to the last time any peer was asked for
/// it; an entry younger than the getdata interval defers this peer's
/// request with jitter instead of duplicating it.
pub fn get_tx_requests(
    state: &mut TxDownloadState,
    is_inbound: bool,
    already_requested: &mut HashMap<TxId, u64>,
    already_have: impl Fn(&TxId) -> bool,
    now_ms: u64,
    rng: &mut impl Rng,
) -> Vec<TxId> {
    let expired = state.expire_in_flight(now_ms);
    for txid in &expired {
        debug!("timeout of inflight tx {:?}", txid);
        already_requested.remove(txid);
    }

    let mut requests = Vec::new();
    while state.in_flight.len() < MAX_PEER_TX_IN_FLIGHT {
        let Some(txid) = state.pop_due(now_ms) else {
            break;
        };
        if already_have(&txid) {
            state.announced.remove(&txid);
            continue;
        }
        match already_requested.get(&txid) {
            Some(&last) if last + GETDATA_TX_INTERVAL_MS > now_ms => {
                // Someone else asked recently; retry after their request
                // would have expired, plus inbound delay and jitter.
                let retry = last
                    + GETDATA_TX_INTERVAL_MS
                    + announcement_delay(is_inbound)
                    + rng.gen_range(0..=MAX_GETDATA_RANDOM_DELAY_MS);
                state.requeue(txid, retry);
            }
            _ => {
                already_requested.insert(txid, now_ms);
                state.in_flight.insert(txid, now_ms);
                requests.push(txid);
            }
        }
    }
    requests
}
