//! Probabilistic membership filters
//!
//! `RollingFilter` tracks recently seen ids with bounded memory by rotating
//! generations; used for recent rejects and recently confirmed
//! transactions. `PeerBloomFilter` is the per-peer transaction filter a
//! peer can load to restrict what we relay to it.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Rolling membership filter over 32-byte ids.
///
/// Keeps three generations of salted 64-bit fingerprints. Insertions go to
/// the current generation; once it fills, the oldest generation is dropped.
/// An entry stays queryable for at least two generations' worth of inserts.
pub struct RollingFilter {
    generations: [std::collections::HashSet<u64>; 3],
    current: usize,
    entries_per_generation: usize,
    salt: u64,
}

impl RollingFilter {
    pub fn new(max_entries: usize, rng: &mut impl Rng) -> Self {
        RollingFilter {
            generations: Default::default(),
            current: 0,
            entries_per_generation: (max_entries / 2).max(1),
            salt: rng.gen(),
        }
    }

    fn fingerprint(&self, id: &[u8; 32]) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.to_le_bytes());
        hasher.update(id);
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }

    pub fn insert(&mut self, id: &[u8; 32]) {
        let fp = self.fingerprint(id);
        if self.generations[self.current].len() >= self.entries_per_generation {
            self.current = (self.current + 1) % 3;
            self.generations[self.current].clear();
        }
        self.generations[self.current].insert(fp);
    }

    pub fn contains(&self, id: &[u8; 32]) -> bool {
        let fp = self.fingerprint(id);
        self.generations.iter().any(|g| g.contains(&fp))
    }

    /// Drop everything.
    pub fn reset(&mut self) {
        for g in &mut self.generations {
            g.clear();
        }
        self.current = 0;
    }
}

/// Maximum size of a loaded peer filter, in bytes of bit data.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Maximum number of hash functions a peer may request.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Classic bloom filter loaded by a peer via filterload.
pub struct PeerBloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
    tweak: u32,
}

impl PeerBloomFilter {
    /// Build from filterload parameters. Returns `None` when the parameters
    /// exceed protocol limits.
    pub fn from_load(bits: Vec<u8>, num_hashes: u32, tweak: u32) -> Option<Self> {
        if bits.len() > MAX_BLOOM_FILTER_SIZE || num_hashes > MAX_HASH_FUNCS {
            return None;
        }
        Some(PeerBloomFilter {
            bits,
            num_hashes,
            tweak,
        })
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(n.to_le_bytes());
        hasher.update(self.tweak.to_le_bytes());
        hasher.update(data);
        let digest = hasher.finalize();
        let v = u64::from_le_bytes(digest[..8].try_into().unwrap());
        (v as usize) % (self.bits.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.bits.is_empty() {
            return;
        }
        for n in 0..self.num_hashes {
            let idx = self.bit_index(n, data);
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        (0..self.num_hashes).all(|n| {
            let idx = self.bit_index(n, data);
            self.bits[idx / 8] & (1 << (idx % 8)) != 0
        })
    }
}
