//! `TombstoneFilter`: a k-hash Bloom filter over keys.
//!
//! Standard m/k sizing and double-hashing bit-index derivation, generalized
//! to generic keys (`K: Hash`) rather than raw byte slices. Each instance is
//! built with its own independent random salts, drawn from a seeded
//! `rand::rngs::StdRng` rather than a single process-wide hasher.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait BitSlice {
    fn get_bit(&self, idx: usize) -> bool;
}

pub trait BitSliceMut {
    fn set_bit(&mut self, idx: usize, val: bool);
}

impl BitSlice for [u64] {
    fn get_bit(&self, idx: usize) -> bool {
        let word = idx / 64;
        let offset = idx % 64;
        (self[word] & (1u64 << offset)) != 0
    }
}

impl BitSliceMut for [u64] {
    fn set_bit(&mut self, idx: usize, val: bool) {
        let word = idx / 64;
        let offset = idx % 64;
        if val {
            self[word] |= 1u64 << offset;
        } else {
            self[word] &= !(1u64 << offset);
        }
    }
}

/// Approximate-membership filter over tombstone keys.
pub struct TombstoneFilter<K> {
    bits: Vec<u64>,
    num_bits: usize,
    k: usize,
    salts: Vec<u64>,
    _marker: PhantomData<fn(&K)>,
}

impl<K: Hash> TombstoneFilter<K> {
    /// Sizes a filter for `expected_capacity` keys at target false-positive
    /// rate `p`, using exactly `hash_functions` hashes per key (`BF_K`) and
    /// seeded from `seed` so each run/memtable instance carries independent
    /// salts.
    pub fn new(expected_capacity: usize, false_positive_rate: f64, hash_functions: usize, seed: u64) -> Self {
        let n = expected_capacity.max(1) as f64;
        let p = false_positive_rate.clamp(1e-6, 0.5);
        let m = (-(n * p.ln()) / std::f64::consts::LN_2.powi(2)).ceil() as usize;
        let m = m.max(64);
        let k = hash_functions.clamp(1, 30);

        let words = (m + 63) / 64;
        let num_bits = words * 64;

        let mut rng = StdRng::seed_from_u64(seed);
        let salts = (0..k).map(|_| rng.gen::<u64>()).collect();

        Self {
            bits: vec![0u64; words],
            num_bits,
            k,
            salts,
            _marker: PhantomData,
        }
    }

    fn base_hash(key: &K) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn bit_positions(&self, key: &K) -> impl Iterator<Item = usize> + '_ {
        let h = Self::base_hash(key);
        let delta = (h >> 17) | (h << 15);
        self.salts.iter().scan(h, move |state, salt| {
            *state = state.wrapping_add(delta) ^ salt.rotate_left(1);
            Some((*state as usize) % self.num_bits)
        })
    }

    pub fn insert(&mut self, key: &K) {
        let positions: Vec<usize> = self.bit_positions(key).collect();
        for pos in positions {
            self.bits.set_bit(pos, true);
        }
    }

    pub fn lookup(&self, key: &K) -> bool {
        self.bit_positions(key).all(|pos| self.bits.get_bit(pos))
    }

    pub fn clear(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }

    pub fn hash_function_count(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_found() {
        let mut bf: TombstoneFilter<u64> = TombstoneFilter::new(1000, 0.01, 7, 42);
        for i in 0..1000u64 {
            bf.insert(&i);
        }
        for i in 0..1000u64 {
            assert!(bf.lookup(&i), "key {i} should be present");
        }
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let mut bf: TombstoneFilter<u64> = TombstoneFilter::new(5000, 0.01, 7, 7);
        for i in 0..5000u64 {
            bf.insert(&i);
        }
        let mut false_positives = 0;
        for i in 5000..15000u64 {
            if bf.lookup(&i) {
                false_positives += 1;
            }
        }
        let fpr = false_positives as f64 / 10000.0;
        assert!(fpr < 0.05, "fpr too high: {fpr}");
    }

    #[test]
    fn clear_empties_the_filter() {
        let mut bf: TombstoneFilter<u64> = TombstoneFilter::new(100, 0.01, 7, 1);
        bf.insert(&42u64);
        assert!(bf.lookup(&42));
        bf.clear();
        // Not a hard guarantee for an arbitrary bloom filter, but with an
        // all-zero bitset every lookup must miss.
        assert!(!bf.lookup(&42));
    }

    #[test]
    fn hash_function_count_matches_configured_k() {
        let bf: TombstoneFilter<u64> = TombstoneFilter::new(1000, 0.01, 3, 1);
        assert_eq!(bf.hash_function_count(), 3);
    }
}
