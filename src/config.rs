//! Store construction parameters.
//!
//! Centralises every tunable named across §4's component contracts in one
//! place, the way the teacher crate centralises its own tunables in a single
//! config struct passed to `open`. Validation happens once, at construction,
//! and produces [`StoreError::InvalidArgument`] rather than panicking.

use crate::error::StoreError;

/// Maximum key length in bytes (§6).
pub const MAX_KEY_BYTES: usize = 1024;

/// Maximum value length in bytes (§6).
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Construction parameters for [`crate::store::Store`].
///
/// All fields have defaults (see [`StoreConfig::default`]) matching the
/// values named in spec §4.2, §4.8, and §4.9.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Maximum number of entries the active memtable holds before rotation (§4.6).
    pub memtable_size: usize,
    /// Maximum number of immutable memtables the manager's FIFO queue holds
    /// before the oldest is force-submitted for flush (§4.6).
    pub max_immutable_memtables: usize,
    /// Total immutable-queue memory budget, in megabytes, before the oldest
    /// immutable is submitted for flush (§4.6).
    pub max_memory_mb: usize,
    /// Number of threads in the flush worker pool (§5).
    pub flush_workers: usize,
    /// Per-level size multiplier: `max_entries(L) = base_level_entries * level_ratio^L` (§4.8).
    pub level_ratio: f64,
    /// Base per-level byte budget in megabytes, before `level_ratio` scaling (§4.8).
    pub base_level_size_mb: usize,
    /// Base per-level entry budget, before `level_ratio` scaling (§4.8).
    pub base_level_entries: usize,
    /// Count-based limit on the number of L0 runs (§4.8).
    pub max_l0_sstables: usize,
    /// Fraction of a level's hard capacity that triggers compaction eligibility (§4.8).
    pub soft_limit_ratio: f64,
    /// Target false-positive rate for per-run bloom filters (§4.2).
    pub bloom_false_positive_rate: f64,
    /// Every-Nth-key block size for the sparse index (§4.2).
    pub sparse_index_block_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable_size: 1000,
            max_immutable_memtables: 4,
            max_memory_mb: 64,
            flush_workers: 2,
            level_ratio: 10.0,
            base_level_size_mb: 10,
            base_level_entries: 1000,
            max_l0_sstables: 4,
            soft_limit_ratio: 0.85,
            bloom_false_positive_rate: 0.01,
            sparse_index_block_size: 4,
        }
    }
}

impl StoreConfig {
    /// Validates field ranges, returning the first violation found.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.memtable_size == 0 {
            return Err(StoreError::InvalidArgument(
                "memtable_size must be > 0".into(),
            ));
        }
        if self.max_immutable_memtables == 0 {
            return Err(StoreError::InvalidArgument(
                "max_immutable_memtables must be > 0".into(),
            ));
        }
        if self.max_memory_mb == 0 {
            return Err(StoreError::InvalidArgument(
                "max_memory_mb must be > 0".into(),
            ));
        }
        if self.flush_workers == 0 {
            return Err(StoreError::InvalidArgument(
                "flush_workers must be > 0".into(),
            ));
        }
        if !(self.level_ratio > 1.0) {
            return Err(StoreError::InvalidArgument(
                "level_ratio must be > 1.0".into(),
            ));
        }
        if self.base_level_size_mb == 0 || self.base_level_entries == 0 {
            return Err(StoreError::InvalidArgument(
                "base_level_size_mb and base_level_entries must be > 0".into(),
            ));
        }
        if self.max_l0_sstables == 0 {
            return Err(StoreError::InvalidArgument(
                "max_l0_sstables must be > 0".into(),
            ));
        }
        if !(self.soft_limit_ratio > 0.0 && self.soft_limit_ratio <= 1.0) {
            return Err(StoreError::InvalidArgument(
                "soft_limit_ratio must be in (0.0, 1.0]".into(),
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(StoreError::InvalidArgument(
                "bloom_false_positive_rate must be in (0.0, 1.0)".into(),
            ));
        }
        if self.sparse_index_block_size == 0 {
            return Err(StoreError::InvalidArgument(
                "sparse_index_block_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Approximate byte budget of the immutable-memtable queue, derived
    /// from `max_memory_mb`.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb * 1024 * 1024
    }
}

/// Validates a key per §6: non-empty, UTF-8, at most [`MAX_KEY_BYTES`].
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(StoreError::InvalidArgument(format!(
            "key exceeds {MAX_KEY_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Validates a value per §6: at most [`MAX_VALUE_BYTES`].
pub fn validate_value(value: &str) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(StoreError::InvalidArgument(format!(
            "value exceeds {MAX_VALUE_BYTES} bytes"
        )));
    }
    Ok(())
}
