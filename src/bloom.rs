//! Bloom Filter Module
//!
//! A space-efficient probabilistic set used by each run to answer "is this
//! key definitely absent?" without touching the data file (§4.2, C2).
//!
//! No false negatives; `false_positive_rate` bounds the probability of a
//! false positive. Hand-rolled rather than pulled from an external crate:
//! the wire format is a handful of `u64`/`u32`/bytes fields, small enough
//! that owning it avoids depending on an external crate's serialization
//! format for what is, on disk, three integers and a bitmap.
//!
//! # Wire format
//!
//! ```text
//! [num_bits: u64][num_hashes: u32][bits_len: u32][bits: bytes]
//! ```
//! All integers little-endian.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// A bit-vector bloom filter with `k` independent hash functions, derived
/// via double hashing from two FNV-1a digests.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` entries at `false_positive_rate`.
    ///
    /// # Panics
    /// Panics if `expected_items` is 0 or `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // m = -n * ln(p) / (ln(2))^2
        let n = expected_items as f64;
        let m = (-n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let num_bits = m.max(8);

        // k = (m/n) * ln(2)
        let k = ((num_bits as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let num_hashes = k.max(1);

        let byte_len = ((num_bits + 7) / 8) as usize;
        Self {
            bits: vec![0u8; byte_len],
            num_bits,
            num_hashes,
        }
    }

    /// Adds `key` to the set.
    pub fn add(&mut self, key: &str) {
        let (h1, h2) = Self::hash_pair(key.as_bytes());
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.set_bit(idx);
        }
    }

    /// Returns `false` if `key` is definitely absent, `true` if it might be present.
    pub fn might_contain(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key.as_bytes());
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            if !self.get_bit(idx) {
                return false;
            }
        }
        true
    }

    /// Persists the filter to `path`, fsyncing before returning (§4.2).
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.num_bits.to_le_bytes())?;
        file.write_all(&self.num_hashes.to_le_bytes())?;
        file.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        file.write_all(&self.bits)?;
        file.sync_all()?;
        Ok(())
    }

    /// Loads a filter previously written by [`BloomFilter::save_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        file.read_exact(&mut buf8)?;
        let num_bits = u64::from_le_bytes(buf8);

        file.read_exact(&mut buf4)?;
        let num_hashes = u32::from_le_bytes(buf4);

        file.read_exact(&mut buf4)?;
        let bits_len = u32::from_le_bytes(buf4) as usize;

        let mut bits = vec![0u8; bits_len];
        file.read_exact(&mut bits)?;

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// No-op placeholder for the file-backed close/fsync contract of §4.2;
    /// writes are already synced by [`BloomFilter::save_to_file`].
    pub fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        (
            fnv1a_64(key, 0xcbf2_9ce4_8422_2325),
            fnv1a_64(key, 0x517c_c1b7_2722_0a95),
        )
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, idx: u64) {
        let (byte, bit) = ((idx / 8) as usize, (idx % 8) as u8);
        self.bits[byte] |= 1 << bit;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let (byte, bit) = ((idx / 8) as usize, (idx % 8) as u8);
        (self.bits[byte] >> bit) & 1 == 1
    }
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn no_false_negatives() {
        let mut bf = BloomFilter::new(100, 0.01);
        for i in 0..100 {
            bf.add(&format!("key-{i}"));
        }
        for i in 0..100 {
            assert!(bf.might_contain(&format!("key-{i}")));
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.add(&format!("present-{i}"));
        }
        let false_positives = (0..1000)
            .filter(|i| bf.might_contain(&format!("absent-{i}")))
            .count();
        // Generous margin over the 1% target to avoid a flaky test.
        assert!(false_positives < 50, "got {false_positives} false positives");
    }

    #[test]
    fn round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bloom.bf");
        let mut bf = BloomFilter::new(10, 0.01);
        bf.add("hello");
        bf.save_to_file(&path).unwrap();

        let loaded = BloomFilter::load_from_file(&path).unwrap();
        assert!(loaded.might_contain("hello"));
        assert!(!loaded.might_contain("definitely-not-present-xyz"));
    }
}
