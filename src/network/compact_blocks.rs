//! Compact block relay
//!
//! Blocks announced as header plus short transaction ids, reconstructed
//! against the mempool and the extra-transaction cache. Missing
//! transactions are fetched with getblocktxn; reconstruction failures fall
//! back to a full block request.

use crate::mempool::MempoolEntry;
use crate::network::protocol::*;
use crate::network::NetEngine;
use anyhow::Result;
use std::collections::HashMap;
use std::collections::VecDeque;
use tracing::{debug, info};

/// getblocktxn is only served for blocks near the tip.
const MAX_BLOCKTXN_DEPTH: u32 = 10;
/// Reconstruction is attempted for blocks at most this far past our tip.
const MAX_CMPCTBLOCK_AHEAD: u32 = 2;

/// Outcome classes for compact block decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Proceed with reconstruction.
    Ok,
    /// The message is malformed; the sender is at fault.
    Invalid,
    /// Reconstruction cannot proceed (collisions, bad fill); fall back to
    /// a full block request without blaming the sender.
    Failed,
}

/// A block being rebuilt from a compact announcement.
pub struct PartialBlock {
    pub header: BlockHeader,
    header_hash: BlockHash,
    nonce: u64,
    /// Slot per transaction, in block order.
    txs: Vec<Option<Transaction>>,
    /// Expected short id per slot, for fill verification. Prefilled slots
    /// have no expectation.
    expected: Vec<Option<ShortId>>,
}

impl PartialBlock {
    /// Initialize from a compact block, matching short ids against the
    /// mempool snapshot and the extra-transaction cache.
    pub fn new(
        cmpct: &CompactBlock,
        mempool: &[MempoolEntry],
        extra: &VecDeque<(TxId, Transaction)>,
    ) -> Result<Self, ReadStatus> {
        let total = cmpct.total_tx_count();
        if total == 0 || total > 1_000_000 {
            return Err(ReadStatus::Invalid);
        }
        let mut txs: Vec<Option<Transaction>> = vec![None; total];
        let mut expected: Vec<Option<ShortId>> = vec![None; total];
        let mut prefilled_slots = vec![false; total];
        for (index, tx) in &cmpct.prefilled {
            let slot = *index as usize;
            if slot >= total || prefilled_slots[slot] {
                return Err(ReadStatus::Invalid);
            }
            prefilled_slots[slot] = true;
            txs[slot] = Some(tx.clone());
        }

        let header_hash = cmpct.header.hash();
        let mut short_id_slots: HashMap<ShortId, usize> = HashMap::new();
        let mut short_iter = cmpct.short_ids.iter();
        for slot in 0..total {
            if prefilled_slots[slot] {
                continue;
            }
            let Some(short_id) = short_iter.next() else {
                return Err(ReadStatus::Invalid);
            };
            expected[slot] = Some(*short_id);
            if short_id_slots.insert(*short_id, slot).is_some() {
                // Two identical short ids cannot be told apart.
                return Err(ReadStatus::Failed);
            }
        }
        if short_iter.next().is_some() {
            return Err(ReadStatus::Invalid);
        }

        let mut partial = PartialBlock {
            header: cmpct.header,
            header_hash,
            nonce: cmpct.nonce,
            txs,
            expected,
        };

        // Match local transactions. On an ambiguous double match the slot
        // is emptied again; getblocktxn resolves it.
        let mut matched_txid: Vec<Option<TxId>> = vec![None; total];
        let mut try_fill = |partial: &mut PartialBlock, txid: TxId, tx: &Transaction| {
            let short_id = short_tx_id(&partial.header_hash, partial.nonce, &txid);
            if let Some(&slot) = short_id_slots.get(&short_id) {
                match matched_txid[slot] {
                    None => {
                        partial.txs[slot] = Some(tx.clone());
                        matched_txid[slot] = Some(txid);
                    }
                    Some(existing) if existing != txid => {
                        partial.txs[slot] = None;
                    }
                    _ => {}
                }
            }
        };
        for entry in mempool {
            try_fill(&mut partial, entry.txid, &entry.tx);
        }
        for (txid, tx) in extra {
            try_fill(&mut partial, *txid, tx);
        }
        Ok(partial)
    }

    pub fn is_complete(&self) -> bool {
        self.txs.iter().all(|t| t.is_some())
    }

    /// Indices still needing transactions, in block order.
    pub fn missing_indices(&self) -> Vec<u32> {
        self.txs
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Fill the missing slots from a blocktxn response and assemble the
    /// block. Wrong count or short-id mismatch fails the reconstruction.
    pub fn fill(&mut self, provided: Vec<Transaction>) -> Result<Block, ReadStatus> {
        let missing = self.missing_indices();
        if provided.len() != missing.len() {
            return Err(ReadStatus::Failed);
        }
        for (slot, tx) in missing.into_iter().zip(provided) {
            let slot = slot as usize;
            if let Some(expected) = self.expected[slot] {
                let got = short_tx_id(&self.header_hash, self.nonce, &tx.txid());
                if got != expected {
                    return Err(ReadStatus::Failed);
                }
            }
            self.txs[slot] = Some(tx);
        }
        self.assemble()
    }

    /// Assemble the block from fully populated slots.
    pub fn assemble(&self) -> Result<Block, ReadStatus> {
        if !self.is_complete() {
            return Err(ReadStatus::Failed);
        }
        Ok(Block {
            header: self.header,
            txs: self.txs.iter().cloned().map(|t| t.unwrap_or_else(|| unreachable!())).collect(),
        })
    }
}

impl NetEngine {
    pub(crate) async fn handle_sendcmpct(
        &self,
        id: NodeId,
        announce: bool,
        version: u64,
    ) -> Result<()> {
        if version != CMPCTBLOCK_VERSION {
            debug!("{}: ignoring sendcmpct with version {}", id, version);
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if let Some(peer_state) = state.peer_mut(id) {
            peer_state.provides_cmpct = true;
            peer_state.prefers_cmpct = announce;
        }
        Ok(())
    }

    pub(crate) async fn handle_cmpct_block(&self, id: NodeId, cmpct: CompactBlock) -> Result<()> {
        let hash = cmpct.header.hash();
        let now = self.now_ms();

        // Unknown parent: this is really a header announcement we cannot
        // attach; go through headers sync.
        let received_new = {
            let chain = self.chain.read().unwrap();
            if chain.lookup(&cmpct.header.prev_hash).is_none() {
                let locator = chain.locator(chain.best_header());
                drop(chain);
                if !self.consensus.is_initial_block_download() {
                    self.send(
                        id,
                        Message::GetHeaders {
                            locator,
                            stop: BlockHash::default(),
                        },
                    );
                }
                return Ok(());
            }
            chain.lookup(&hash).is_none()
        };

        let key = match self.consensus.process_headers(&[cmpct.header]) {
            Ok(key) => key,
            Err(err) => {
                self.misbehaving(id, err.penalty, &err.reason);
                anyhow::bail!("invalid compact block header from {}: {}", id, err.reason);
            }
        };

        let mut state = self.state.lock().await;
        let chain = self.chain.read().unwrap();
        if received_new {
            if let Some(peer_state) = state.peer_mut(id) {
                peer_state.last_block_announcement_ms = now;
            }
        }
        state.update_block_availability(&chain, id, hash);

        let rec = chain.get(key);
        let already_in_flight_here = state.block_in_flight_from(&hash) == Some(id);
        let in_flight_elsewhere =
            state.block_in_flight_from(&hash).is_some() && !already_in_flight_here;

        if rec.has_data {
            return Ok(());
        }
        if rec.work <= chain.tip_record().work {
            // Not better than our tip. If we asked for it, downgrade to a
            // full block request; otherwise ignore.
            if already_in_flight_here {
                drop(chain);
                drop(state);
                self.send(id, Message::GetData(vec![InvItem::Block(hash)]));
            }
            return Ok(());
        }

        let tip_fresh = chain.tip_record().time_ms()
            + 20 * self.config.target_block_interval_ms
            > now;
        if !tip_fresh && !already_in_flight_here {
            return Ok(());
        }

        if rec.height > chain.height() + MAX_CMPCTBLOCK_AHEAD {
            // Too far ahead to reconstruct against our mempool; let normal
            // block download handle it.
            if already_in_flight_here {
                drop(chain);
                drop(state);
                self.send(id, Message::GetData(vec![InvItem::Block(hash)]));
            }
            return Ok(());
        }
        drop(chain);

        let snapshot = self.mempool.snapshot();
        if !in_flight_elsewhere {
            // Claim (or keep) the download slot with a reconstruction in
            // progress.
            let partial = match PartialBlock::new(&cmpct, &snapshot, &state.extra_txns) {
                Ok(partial) => partial,
                Err(ReadStatus::Invalid) => {
                    drop(state);
                    self.misbehaving(id, 100, "invalid compact block");
                    return Ok(());
                }
                Err(_) => {
                    drop(state);
                    self.send(id, Message::GetData(vec![InvItem::Block(hash)]));
                    return Ok(());
                }
            };
            let complete = partial.is_complete();
            let missing = partial.missing_indices();
            if already_in_flight_here {
                // Attach the reconstruction to the existing request slot.
                let upgraded = state
                    .peer_mut(id)
                    .and_then(|p| p.blocks_in_flight.iter_mut().find(|q| q.hash == hash))
                    .map(|queued| {
                        let upgraded = queued.key.is_none();
                        queued.key = Some(key);
                        queued.partial = Some(Box::new(partial));
                        upgraded
                    })
                    .unwrap_or(false);
                if upgraded {
                    let first = state
                        .peer_mut(id)
                        .map(|p| {
                            p.in_flight_valid_headers += 1;
                            p.in_flight_valid_headers == 1
                        })
                        .unwrap_or(false);
                    if first {
                        state.validated_download_peers += 1;
                    }
                }
            } else {
                state.mark_block_as_in_flight(id, hash, Some(key), Some(Box::new(partial)), now);
            }
            drop(state);
            if complete {
                // Everything matched locally; jump straight to the fill
                // path with an empty transaction list.
                self.handle_block_txn(
                    id,
                    BlockTransactions {
                        block_hash: hash,
                        txs: Vec::new(),
                    },
                )
                .await?;
            } else {
                debug!(
                    "requesting {} missing transactions of {:?} from {}",
                    missing.len(),
                    hash,
                    id
                );
                self.send(
                    id,
                    Message::GetBlockTxn(BlockTransactionsRequest {
                        block_hash: hash,
                        indices: missing,
                    }),
                );
            }
        } else {
            // Another peer owns the slot. Reconstruct optimistically from
            // what we have; on any miss, leave it to the owner.
            match PartialBlock::new(&cmpct, &snapshot, &state.extra_txns) {
                Ok(partial) if partial.is_complete() => {
                    if let Ok(block) = partial.assemble() {
                        state.block_source.entry(hash).or_insert((id, false));
                        drop(state);
                        let accepted = self.consensus.process_block(&block, true);
                        if accepted {
                            // The owner's claim is released only now that
                            // the block validated.
                            let mut state = self.state.lock().await;
                            state.mark_block_as_received(&hash, now);
                            state.block_source.remove(&hash);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_get_block_txn(
        &self,
        id: NodeId,
        req: BlockTransactionsRequest,
    ) -> Result<()> {
        // Fast path: the block we most recently validated.
        let cached = {
            let state = self.state.lock().await;
            state
                .most_recent_block
                .as_ref()
                .filter(|(hash, _, _)| *hash == req.block_hash)
                .map(|(_, block, _)| block.clone())
        };
        let block = match cached {
            Some(block) => block,
            None => {
                let deep = {
                    let chain = self.chain.read().unwrap();
                    chain
                        .lookup(&req.block_hash)
                        .map(|key| chain.get(key).height + MAX_BLOCKTXN_DEPTH < chain.height())
                        .unwrap_or(true)
                };
                if deep {
                    // Old block: reconstruction no longer makes sense, a
                    // full block answers the intent.
                    debug!(
                        "{}: getblocktxn for out-of-range block {:?}",
                        id, req.block_hash
                    );
                    if let Some(block) = self.block_store.get_block(&req.block_hash) {
                        self.send(id, Message::Block(block));
                    }
                    return Ok(());
                }
                match self.block_store.get_block(&req.block_hash) {
                    Some(block) => block,
                    None => return Ok(()),
                }
            }
        };
        let mut txs = Vec::with_capacity(req.indices.len());
        for index in &req.indices {
            match block.txs.get(*index as usize) {
                Some(tx) => txs.push(tx.clone()),
                None => {
                    self.misbehaving(id, 100, "getblocktxn index out of range");
                    return Ok(());
                }
            }
        }
        self.send(
            id,
            Message::BlockTxn(BlockTransactions {
                block_hash: req.block_hash,
                txs,
            }),
        );
        Ok(())
    }

    pub(crate) async fn handle_block_txn(&self, id: NodeId, resp: BlockTransactions) -> Result<()> {
        let hash = resp.block_hash;
        let now = self.now_ms();
        let mut state = self.state.lock().await;
        let Some(partial) = state.partial_block_mut(id, &hash) else {
            debug!(
                "{}: blocktxn for block {:?} we were not expecting",
                id, hash
            );
            return Ok(());
        };
        match partial.fill(resp.txs) {
            Ok(block) => {
                state.mark_block_as_received(&hash, now);
                state.block_source.insert(hash, (id, true));
                drop(state);
                let accepted = self.consensus.process_block(&block, true);
                if accepted {
                    let mut state = self.state.lock().await;
                    state.block_source.remove(&hash);
                }
            }
            Err(ReadStatus::Invalid) => {
                state.mark_block_as_received(&hash, now);
                drop(state);
                self.misbehaving(id, 100, "invalid blocktxn");
            }
            Err(_) => {
                // Short id mismatch or bad count; re-request the full
                // block from the same peer. The header was accepted when
                // the compact block arrived, so the index key is known and
                // the peer keeps its validated-download standing.
                let key = self.chain.read().unwrap().lookup(&hash);
                state.mark_block_as_received(&hash, now);
                state.mark_block_as_in_flight(id, hash, key, None, now);
                drop(state);
                debug!("failed to reconstruct {:?}, requesting full block", hash);
                self.send(id, Message::GetData(vec![InvItem::Block(hash)]));
            }
        }
        Ok(())
    }

    /// Validation callback: a newly mined or received block passed proof
    /// checks. Push it to compact announcers before full validation
    /// completes elsewhere.
    pub async fn new_pow_valid_block(&self, block: &Block) {
        let hash = block.header.hash();
        let (height, parent_key) = {
            let chain = self.chain.read().unwrap();
            let Some(key) = chain.lookup(&hash) else {
                return;
            };
            (chain.get(key).height, chain.get(key).parent)
        };
        let mut state = self.state.lock().await;
        if height <= state.highest_fast_announce {
            return;
        }
        state.highest_fast_announce = height;
        let nonce = rand::Rng::gen(&mut state.rng);
        let cmpct = CompactBlock::from_block(block, nonce);
        state.most_recent_block = Some((hash, block.clone(), cmpct.clone()));
        let mut push_to = Vec::new();
        {
            let chain = self.chain.read().unwrap();
            for announcer in state.compact_announcers() {
                let wants = state
                    .peer(announcer)
                    .map(|p| p.prefers_cmpct)
                    .unwrap_or(false);
                let has_parent = parent_key
                    .map(|parent| state.peer_has_block(&chain, announcer, parent))
                    .unwrap_or(false);
                if wants && has_parent {
                    push_to.push(announcer);
                }
            }
        }
        drop(state);
        for announcer in &push_to {
            info!(
                "sending header-and-ids {:?} to peer {}",
                hash, announcer.0
            );
            self.send(*announcer, Message::CmpctBlock(cmpct.clone()));
        }
    }
}
