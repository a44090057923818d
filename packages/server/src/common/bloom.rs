//! Rotating bloom filters for process-local fast paths.
//!
//! Three filters back the queue engine: idempotency (skip a KV GET on cold
//! misses), ghost ids (skip the hash lookup for deleted tasks popped from a
//! queue), and cleanup (dedupe work between concurrent janitors). They are
//! best-effort caches and must never be load-bearing for correctness.
//!
//! Memory is bounded by rotation: two bit-vector generations, with the
//! current one swapped to previous at the configured interval. Queries
//! consult both generations; inserts touch only the current one. Entries are
//! set-only and never cleared outside rotation.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use siphasher::sip::SipHasher13;

// Two independent seeds for double hashing: index_i = h1 + i * h2.
const SEED_A: (u64, u64) = (0x7368_6f72_745f_6b65, 0x795f_6f6e_655f_7631);
const SEED_B: (u64, u64) = (0x616e_6f74_6865_725f, 0x6b65_795f_7477_6f31);

#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// Expected number of distinct items per generation.
    pub capacity: usize,
    /// Target false-positive rate at capacity.
    pub false_positive_rate: f64,
    /// How often the current generation is swapped out.
    pub rotate_every: Duration,
}

struct BitSet {
    words: Vec<AtomicU64>,
}

impl BitSet {
    fn new(bits: u64) -> Self {
        let words = bits.div_ceil(64) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn set(&self, index: u64) {
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        self.words[word].fetch_or(mask, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self, index: u64) -> bool {
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }
}

struct Generations {
    current: BitSet,
    previous: BitSet,
    rotated_at: Instant,
}

pub struct RotatingBloom {
    bits: u64,
    hashes: u32,
    rotate_every: Duration,
    generations: RwLock<Generations>,
}

impl RotatingBloom {
    pub fn new(config: BloomConfig) -> Self {
        let n = config.capacity.max(1) as f64;
        let p = config.false_positive_rate.clamp(1e-15, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let bits = ((-(n * p.ln())) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let hashes = ((bits as f64 / n) * ln2).round().max(1.0) as u32;

        Self {
            bits,
            hashes,
            rotate_every: config.rotate_every,
            generations: RwLock::new(Generations {
                current: BitSet::new(bits),
                previous: BitSet::new(bits),
                rotated_at: Instant::now(),
            }),
        }
    }

    pub fn insert(&self, item: &str) {
        self.maybe_rotate();
        let (h1, h2) = self.fingerprint(item);
        let generations = self.generations.read().expect("bloom lock poisoned");
        for i in 0..self.hashes {
            generations.current.set(self.index(h1, h2, i));
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        let (h1, h2) = self.fingerprint(item);
        let generations = self.generations.read().expect("bloom lock poisoned");

        let hit = |set: &BitSet| (0..self.hashes).all(|i| set.get(self.index(h1, h2, i)));
        hit(&generations.current) || hit(&generations.previous)
    }

    /// Swap the current generation out immediately.
    pub fn rotate(&self) {
        let mut generations = self.generations.write().expect("bloom lock poisoned");
        generations.previous =
            std::mem::replace(&mut generations.current, BitSet::new(self.bits));
        generations.rotated_at = Instant::now();
    }

    fn maybe_rotate(&self) {
        let due = {
            let generations = self.generations.read().expect("bloom lock poisoned");
            generations.rotated_at.elapsed() >= self.rotate_every
        };
        if !due {
            return;
        }
        let mut generations = self.generations.write().expect("bloom lock poisoned");
        // Re-check under the write lock; another thread may have rotated.
        if generations.rotated_at.elapsed() >= self.rotate_every {
            generations.previous =
                std::mem::replace(&mut generations.current, BitSet::new(self.bits));
            generations.rotated_at = Instant::now();
        }
    }

    #[inline]
    fn index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bits
    }

    fn fingerprint(&self, item: &str) -> (u64, u64) {
        let mut a = SipHasher13::new_with_keys(SEED_A.0, SEED_A.1);
        a.write(item.as_bytes());
        let mut b = SipHasher13::new_with_keys(SEED_B.0, SEED_B.1);
        b.write(item.as_bytes());
        (a.finish(), b.finish() | 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> RotatingBloom {
        RotatingBloom::new(BloomConfig {
            capacity: 10_000,
            false_positive_rate: 0.01,
            rotate_every: Duration::from_secs(3600),
        })
    }

    #[test]
    fn inserted_items_are_found() {
        let bloom = filter();
        for i in 0..1000 {
            bloom.insert(&format!("task-{i}"));
        }
        for i in 0..1000 {
            assert!(bloom.contains(&format!("task-{i}")));
        }
    }

    #[test]
    fn unseen_items_mostly_miss() {
        let bloom = filter();
        for i in 0..1000 {
            bloom.insert(&format!("task-{i}"));
        }
        let false_positives = (0..1000)
            .filter(|i| bloom.contains(&format!("other-{i}")))
            .count();
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    #[test]
    fn one_rotation_keeps_previous_generation_visible() {
        let bloom = filter();
        bloom.insert("survivor");
        bloom.rotate();
        assert!(bloom.contains("survivor"));
    }

    #[test]
    fn two_rotations_forget() {
        let bloom = filter();
        bloom.insert("ephemeral");
        bloom.rotate();
        bloom.rotate();
        assert!(!bloom.contains("ephemeral"));
    }
}
