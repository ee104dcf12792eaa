//! Sparse Index Module
//!
//! Every-Nth-key `(key, byte_offset)` map that lets a point lookup bound its
//! scan to a single ≈`block_size`-entry window of a run's data file,
//! instead of scanning the whole file (§4.2, C3).
//!
//! # Wire format
//!
//! ```text
//! [block_size: u32][num_entries: u32]
//! ([key_len: u32][key bytes][offset: u64])*
//! ```
//! All integers little-endian.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Default "index every Nth key" block size (§4.2).
pub const DEFAULT_BLOCK_SIZE: usize = 4;

/// An ordered `(key, byte_offset)` index into a run's `data.db`.
#[derive(Debug, Clone)]
pub struct SparseIndex {
    block_size: usize,
    entries: Vec<(String, u64)>,
}

impl SparseIndex {
    /// Creates an empty index with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            entries: Vec::new(),
        }
    }

    /// Returns the configured block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Records `(key, offset)`. Callers are responsible for only indexing
    /// every `block_size`-th key and for calling this in ascending key order.
    pub fn push(&mut self, key: String, offset: u64) {
        self.entries.push((key, offset));
    }

    /// The largest indexed offset whose key is `<= target`, or `0` if
    /// `target` precedes every indexed key (bisect-right-then-step-back
    /// semantics).
    pub fn find_block_offset(&self, target: &str) -> u64 {
        // Partition point: first index whose key > target.
        let idx = self.entries.partition_point(|(k, _)| k.as_str() <= target);
        if idx == 0 {
            0
        } else {
            self.entries[idx - 1].1
        }
    }

    /// The smallest indexed offset whose key is `>= target`, or `None` if
    /// `target` exceeds every indexed key.
    pub fn find_ceil_offset(&self, target: &str) -> Option<u64> {
        let idx = self.entries.partition_point(|(k, _)| k.as_str() < target);
        self.entries.get(idx).map(|(_, off)| *off)
    }

    /// Returns `(start, end)` where `start = find_block_offset(key)` and
    /// `end` is the first indexed offset strictly greater than `key`, or
    /// `None` (scan to EOF) if no such offset exists.
    pub fn get_scan_range(&self, key: &str) -> (u64, Option<u64>) {
        let start = self.find_block_offset(key);
        let idx = self.entries.partition_point(|(k, _)| k.as_str() <= key);
        let end = self.entries.get(idx).map(|(_, off)| *off);
        (start, end)
    }

    /// Number of indexed entries (not the number of entries in the run).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys have been indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialises to `path` per the wire format above.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&(self.block_size as u32).to_le_bytes())?;
        file.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for (key, offset) in &self.entries {
            let key_bytes = key.as_bytes();
            file.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
            file.write_all(key_bytes)?;
            file.write_all(&offset.to_le_bytes())?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Deserialises an index previously written by [`SparseIndex::save_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        file.read_exact(&mut buf4)?;
        let block_size = u32::from_le_bytes(buf4) as usize;

        file.read_exact(&mut buf4)?;
        let num_entries = u32::from_le_bytes(buf4) as usize;

        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            file.read_exact(&mut buf4)?;
            let key_len = u32::from_le_bytes(buf4) as usize;
            let mut key_bytes = vec![0u8; key_len];
            file.read_exact(&mut key_bytes)?;
            let key = String::from_utf8(key_bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            file.read_exact(&mut buf8)?;
            let offset = u64::from_le_bytes(buf8);

            entries.push((key, offset));
        }

        Ok(Self {
            block_size,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SparseIndex {
        let mut idx = SparseIndex::new(4);
        idx.push("k0000".into(), 0);
        idx.push("k0004".into(), 100);
        idx.push("k0008".into(), 220);
        idx
    }

    #[test]
    fn floor_lookup_before_first_key_is_zero() {
        let idx = sample();
        assert_eq!(idx.find_block_offset("k0000"), 0);
        assert_eq!(idx.find_block_offset("aaaa"), 0);
    }

    #[test]
    fn floor_lookup_between_keys_returns_lower_offset() {
        let idx = sample();
        assert_eq!(idx.find_block_offset("k0005"), 100);
        assert_eq!(idx.find_block_offset("k0009"), 220);
    }

    #[test]
    fn ceil_lookup_past_last_key_is_absent() {
        let idx = sample();
        assert_eq!(idx.find_ceil_offset("zzzz"), None);
        assert_eq!(idx.find_ceil_offset("k0004"), Some(100));
        assert_eq!(idx.find_ceil_offset("k0005"), Some(220));
    }

    #[test]
    fn scan_range_bounds_a_single_block() {
        let idx = sample();
        assert_eq!(idx.get_scan_range("k0005"), (100, Some(220)));
        assert_eq!(idx.get_scan_range("k0009"), (220, None));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sparse_index.idx");
        let idx = sample();
        idx.save_to_file(&path).unwrap();

        let loaded = SparseIndex::load_from_file(&path).unwrap();
        assert_eq!(loaded.block_size(), 4);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.find_block_offset("k0005"), 100);
    }
}
