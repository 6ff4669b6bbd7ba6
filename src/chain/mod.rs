//! In-memory block header index
//!
//! Stores every validated header in an append-only arena addressed by
//! `BlockKey`. Parent and skip links are arena indices, so ancestor walks
//! and fork-point computation never touch a hash map after the initial
//! lookup. The active chain is kept as a dense height-indexed vector.

use crate::network::protocol::{BlockHash, BlockHeader};
use std::collections::HashMap;

/// Stable handle to a header record in the index arena.
///
/// Keys are never reused; a key handed out once stays valid for the life of
/// the index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlockKey(pub u32);

/// One indexed header.
#[derive(Clone, Debug)]
pub struct BlockRecord {
    pub hash: BlockHash,
    pub header: BlockHeader,
    /// Parent record; `None` only for genesis.
    pub parent: Option<BlockKey>,
    /// Skip pointer for O(log n) ancestor walks.
    pub skip: Option<BlockKey>,
    pub height: u32,
    /// Cumulative work from genesis.
    pub work: u128,
    /// Full block data has been received and stored.
    pub has_data: bool,
    /// This block and all its ancestors have data.
    pub fully_linked: bool,
}

impl BlockRecord {
    /// Block time in milliseconds, for comparison against engine clocks.
    pub fn time_ms(&self) -> u64 {
        self.header.time * 1_000
    }
}

/// Header tree plus the currently active chain.
pub struct BlockIndex {
    records: Vec<BlockRecord>,
    by_hash: HashMap<BlockHash, BlockKey>,
    children: HashMap<BlockKey, Vec<BlockKey>>,
    /// `active[h]` is the active-chain block at height `h`.
    active: Vec<BlockKey>,
    /// Highest-work fully linked block seen, even if not yet active.
    best_header: BlockKey,
}

// Skip heights follow the pattern used by header-chain skip lists: strip the
// lowest set bit, twice for odd heights.
fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

impl BlockIndex {
    /// Create an index rooted at the given genesis header. Genesis is active
    /// and considered to have data.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let record = BlockRecord {
            hash,
            header: genesis,
            parent: None,
            skip: None,
            height: 0,
            work: 1,
            has_data: true,
            fully_linked: true,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, BlockKey(0));
        BlockIndex {
            records: vec![record],
            by_hash,
            children: HashMap::new(),
            active: vec![BlockKey(0)],
            best_header: BlockKey(0),
        }
    }

    pub fn genesis(&self) -> BlockKey {
        BlockKey(0)
    }

    pub fn get(&self, key: BlockKey) -> &BlockRecord {
        &self.records[key.0 as usize]
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<BlockKey> {
        self.by_hash.get(hash).copied()
    }

    /// Number of headers in the index.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Insert a header whose parent is already indexed. Returns the existing
    /// key for duplicates and `None` when the parent is unknown.
    pub fn insert(&mut self, header: BlockHeader, work_increment: u128) -> Option<BlockKey> {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return Some(*existing);
        }
        let parent = self.by_hash.get(&header.prev_hash).copied()?;
        let parent_rec = self.get(parent);
        let height = parent_rec.height + 1;
        let work = parent_rec.work + work_increment.max(1);
        let skip = self.ancestor_at(parent, skip_height(height));
        let key = BlockKey(self.records.len() as u32);
        self.records.push(BlockRecord {
            hash,
            header,
            parent: Some(parent),
            skip,
            height,
            work,
            has_data: false,
            fully_linked: false,
        });
        self.by_hash.insert(hash, key);
        self.children.entry(parent).or_default().push(key);
        if work > self.get(self.best_header).work {
            self.best_header = key;
        }
        Some(key)
    }

    /// Walk to the ancestor of `key` at `height` using skip pointers.
    pub fn ancestor_at(&self, key: BlockKey, height: u32) -> Option<BlockKey> {
        let mut cur = key;
        let mut cur_height = self.get(cur).height;
        if height > cur_height {
            return None;
        }
        while cur_height > height {
            let rec = self.get(cur);
            match rec.skip {
                Some(skip) if self.get(skip).height >= height => {
                    cur = skip;
                }
                _ => {
                    cur = rec.parent?;
                }
            }
            cur_height = self.get(cur).height;
        }
        Some(cur)
    }

    /// Deepest block on both ancestries of `a` and `b`.
    pub fn last_common_ancestor(&self, a: BlockKey, b: BlockKey) -> BlockKey {
        let (mut a, mut b) = (a, b);
        let ha = self.get(a).height;
        let hb = self.get(b).height;
        if ha > hb {
            a = self.ancestor_at(a, hb).unwrap_or(self.genesis());
        } else if hb > ha {
            b = self.ancestor_at(b, ha).unwrap_or(self.genesis());
        }
        while a != b {
            let (ra, rb) = (self.get(a), self.get(b));
            match (ra.parent, rb.parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => return self.genesis(),
            }
        }
        a
    }

    /// Whether `ancestor` lies on the ancestry of `key` (inclusive).
    pub fn is_ancestor(&self, ancestor: BlockKey, key: BlockKey) -> bool {
        self.ancestor_at(key, self.get(ancestor).height) == Some(ancestor)
    }

    /// Active chain tip.
    pub fn tip(&self) -> BlockKey {
        *self.active.last().unwrap_or(&BlockKey(0))
    }

    pub fn tip_record(&self) -> &BlockRecord {
        self.get(self.tip())
    }

    pub fn height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    /// Highest-work header known, active or not.
    pub fn best_header(&self) -> BlockKey {
        self.best_header
    }

    /// Active-chain block at a height, if within the chain.
    pub fn active_at(&self, height: u32) -> Option<BlockKey> {
        self.active.get(height as usize).copied()
    }

    /// Whether `key` is on the active chain.
    pub fn is_active(&self, key: BlockKey) -> bool {
        self.active_at(self.get(key).height) == Some(key)
    }

    /// Re-point the active chain at `tip`, rewriting the diverging suffix.
    pub fn set_active_tip(&mut self, tip: BlockKey) {
        let mut path = Vec::new();
        let mut cur = tip;
        loop {
            let rec = self.get(cur);
            if self.active_at(rec.height) == Some(cur) {
                break;
            }
            path.push(cur);
            match rec.parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        let fork_height = self.get(cur).height;
        self.active.truncate(fork_height as usize + 1);
        for key in path.into_iter().rev() {
            self.active.push(key);
        }
    }

    /// Record that full block data arrived for `key`, cascading the
    /// fully-linked bit to descendants whose ancestry is now complete.
    pub fn mark_has_data(&mut self, key: BlockKey) {
        self.records[key.0 as usize].has_data = true;
        let parent_linked = match self.records[key.0 as usize].parent {
            Some(parent) => self.records[parent.0 as usize].fully_linked,
            None => true,
        };
        if !parent_linked {
            return;
        }
        let mut queue = vec![key];
        while let Some(cur) = queue.pop() {
            let rec = &mut self.records[cur.0 as usize];
            if rec.fully_linked || !rec.has_data {
                continue;
            }
            rec.fully_linked = true;
            if let Some(children) = self.children.get(&cur) {
                queue.extend(children.iter().copied());
            }
        }
    }

    /// Exponentially spaced locator starting from `from`.
    pub fn locator(&self, from: BlockKey) -> Vec<BlockHash> {
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut height = self.get(from).height as i64;
        let from_height = self.get(from).height;
        while height >= 0 {
            if let Some(key) = self.ancestor_at(from, height as u32) {
                hashes.push(self.get(key).hash);
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height -= step as i64;
        }
        let genesis_hash = self.get(self.genesis()).hash;
        if hashes.last() != Some(&genesis_hash) && from_height > 0 {
            hashes.push(genesis_hash);
        }
        hashes
    }

    /// Deepest active-chain block named by a locator, defaulting to genesis.
    pub fn find_fork_from_locator(&self, locator: &[BlockHash]) -> BlockKey {
        for hash in locator {
            if let Some(key) = self.lookup(hash) {
                if self.is_active(key) {
                    return key;
                }
                // Named block is on a fork; its fork point with our tip is
                // the deepest common block.
                return self.last_common_ancestor(key, self.tip());
            }
        }
        self.genesis()
    }

    /// Up to `max` active-chain headers strictly after `from`, stopping at
    /// `stop` if it is reached.
    pub fn headers_after(
        &self,
        from: BlockKey,
        stop: Option<&BlockHash>,
        max: usize,
    ) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut height = self.get(from).height + 1;
        while out.len() < max {
            let Some(key) = self.active_at(height) else {
                break;
            };
            let rec = self.get(key);
            out.push(rec.header);
            if stop == Some(&rec.hash) {
                break;
            }
            height += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(parent: BlockHash, nonce: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: parent,
            merkle_root: [0; 32],
            time: 1_700_000_000 + nonce,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    fn genesis_header() -> BlockHeader {
        header(BlockHash([0; 32]), 0)
    }

    /// Extend `count` blocks on top of `from`, returning the new tip key.
    fn extend(index: &mut BlockIndex, from: BlockKey, count: u32, salt: u64) -> BlockKey {
        let mut tip = from;
        for i in 0..count {
            let h = header(index.get(tip).hash, salt * 1_000_000 + i as u64 + 1);
            tip = index.insert(h, 2).unwrap();
        }
        tip
    }

    #[test]
    fn test_insert_rejects_unknown_parent() {
        let mut index = BlockIndex::new(genesis_header());
        let orphan = header(BlockHash([0xaa; 32]), 5);
        assert!(index.insert(orphan, 2).is_none());
    }

    #[test]
    fn test_insert_duplicate_returns_existing_key() {
        let mut index = BlockIndex::new(genesis_header());
        let h = header(index.get(index.genesis()).hash, 1);
        let a = index.insert(h, 2).unwrap();
        let b = index.insert(h, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_ancestor_at_walks_long_chains() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let tip = extend(&mut index, genesis, 300, 1);
        assert_eq!(index.get(tip).height, 300);
        for target in [0u32, 1, 17, 128, 255, 299, 300] {
            let anc = index.ancestor_at(tip, target).unwrap();
            assert_eq!(index.get(anc).height, target);
        }
        assert!(index.ancestor_at(genesis, 5).is_none());
    }

    #[test]
    fn test_last_common_ancestor_at_fork() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let base = extend(&mut index, genesis, 10, 1);
        let a = extend(&mut index, base, 5, 2);
        let b = extend(&mut index, base, 8, 3);
        assert_eq!(index.last_common_ancestor(a, b), base);
        assert_eq!(index.last_common_ancestor(a, base), base);
    }

    #[test]
    fn test_set_active_tip_reorgs_suffix() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let base = extend(&mut index, genesis, 4, 1);
        let a = extend(&mut index, base, 3, 2);
        index.set_active_tip(a);
        assert_eq!(index.tip(), a);
        assert_eq!(index.height(), 7);

        let b = extend(&mut index, base, 5, 3);
        index.set_active_tip(b);
        assert_eq!(index.tip(), b);
        assert_eq!(index.height(), 9);
        assert!(index.is_active(base));
        assert!(!index.is_active(a));
    }

    #[test]
    fn test_fully_linked_requires_ancestor_data() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let a = extend(&mut index, genesis, 1, 1);
        let b = extend(&mut index, a, 1, 2);
        index.mark_has_data(b);
        assert!(!index.get(b).fully_linked);
        index.mark_has_data(a);
        assert!(index.get(a).fully_linked);
        assert!(index.get(b).fully_linked);
    }

    #[test]
    fn test_locator_is_exponential_and_ends_at_genesis() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let tip = extend(&mut index, genesis, 100, 1);
        index.set_active_tip(tip);
        let locator = index.locator(tip);
        assert_eq!(locator[0], index.get(tip).hash);
        assert_eq!(*locator.last().unwrap(), index.get(genesis).hash);
        assert!(locator.len() < 20);
    }

    #[test]
    fn test_find_fork_from_locator_on_stale_branch() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let base = extend(&mut index, genesis, 10, 1);
        let stale = extend(&mut index, base, 3, 2);
        let active = extend(&mut index, base, 6, 3);
        index.set_active_tip(active);
        let fork = index.find_fork_from_locator(&index.locator(stale));
        assert_eq!(fork, base);
    }

    #[test]
    fn test_headers_after_respects_stop_and_max() {
        let mut index = BlockIndex::new(genesis_header());
        let genesis = index.genesis();
        let tip = extend(&mut index, genesis, 20, 1);
        index.set_active_tip(tip);
        let all = index.headers_after(genesis, None, 100);
        assert_eq!(all.len(), 20);
        let capped = index.headers_after(genesis, None, 5);
        assert_eq!(capped.len(), 5);
        let stop_key = index.active_at(3).unwrap();
        let stop_hash = index.get(stop_key).hash;
        let stopped = index.headers_after(genesis, Some(&stop_hash), 100);
        assert_eq!(stopped.len(), 3);
    }
}
