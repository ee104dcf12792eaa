//! Store Facade
//!
//! [`Store`] is the public entry point (§4.9, C11): it wires together the
//! write-ahead log, the memtable manager, the manifests, and the leveled
//! compactor into the single `put`/`get`/`delete` contract the rest of the
//! crate exists to support.
//!
//! # Write path
//!
//! A single [`Mutex`] serialises timestamp assignment, the WAL append, and
//! the memtable write, so two concurrent writers can never interleave into
//! an inconsistent order (§5). Timestamps are wall-clock microseconds,
//! clamped to be strictly increasing even across a coarse clock tick or a
//! clock that moves backward.
//!
//! # Read path
//!
//! `get` checks the memtable manager (active, then immutable, newest
//! first) before falling through to the compactor's levels (L0 newest
//! first, then L1 and deeper in ascending order). The first entry found —
//! tombstone or not — is authoritative.
//!
//! # Flush-time WAL trimming
//!
//! When a memtable is flushed to a new L0 run, the WAL is rewritten to
//! drop exactly the records that run now covers: a record survives if its
//! key was not part of the flush, or if its timestamp is *newer* than the
//! flushed value for that key (a write that landed in the new active
//! memtable while the old one was being flushed must not be lost).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::compaction::{CompactionConfig, Compactor};
use crate::config::{validate_key, validate_value, StoreConfig};
use crate::entry::Entry;
use crate::error::{StoreError, StoreResult};
use crate::manifest::ManifestManager;
use crate::memtable::MemtableManager;
use crate::sstable::Run;
use crate::wal::{Wal, WalRecord};

/// Snapshot of store-wide counters (§9 diagnostics; not part of the core
/// read/write contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub active_memtable_entries: usize,
    pub active_memtable_bytes: usize,
    pub immutable_memtable_count: usize,
    pub total_runs: usize,
    pub next_sstable_id: u32,
}

/// Per-level breakdown for diagnostics (§6 `get_level_info`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelInfo {
    pub level: usize,
    pub run_count: usize,
    pub entry_count: usize,
}

/// An embeddable, persistent, ordered key-value store backed by an
/// LSM-tree (§1).
pub struct Store {
    wal: Arc<Wal>,
    memtable: MemtableManager,
    compactor: Arc<Compactor>,
    manifest: Arc<ManifestManager>,
    next_ts: AtomicU64,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Store {
    /// Opens (or creates) a store rooted at `dir`, replaying its
    /// write-ahead log to recover any writes not yet reflected in a run.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let manifest = Arc::new(ManifestManager::open(&dir)?);
        let compactor = Arc::new(Compactor::new(
            dir.clone(),
            Arc::clone(&manifest),
            CompactionConfig {
                level_ratio: config.level_ratio,
                base_level_entries: config.base_level_entries,
                max_l0_sstables: config.max_l0_sstables,
                soft_limit_ratio: config.soft_limit_ratio,
                sparse_index_block_size: config.sparse_index_block_size,
                bloom_false_positive_rate: config.bloom_false_positive_rate,
            },
        )?);
        let wal = Arc::new(Wal::open(dir.join("wal.log"))?);

        let flush_dir = dir.clone();
        let flush_wal = Arc::clone(&wal);
        let flush_compactor = Arc::clone(&compactor);
        let flush_manifest = Arc::clone(&manifest);
        let block_size = config.sparse_index_block_size;
        let fp_rate = config.bloom_false_positive_rate;
        let memtable = MemtableManager::new(
            config.memtable_size,
            config.max_immutable_memtables,
            config.max_memory_bytes(),
            config.flush_workers,
            move |memtable| {
                let entries = memtable.get_all_entries();
                if entries.is_empty() {
                    return Ok(());
                }
                let id = flush_manifest
                    .allocate_id()
                    .map_err(|e| Box::new(e) as crate::memtable::FlushError)?;
                let run = Run::write(&flush_dir, id, 0, &entries, block_size, fp_rate)
                    .map_err(|e| Box::new(e) as crate::memtable::FlushError)?;

                let mut flushed_max_ts: std::collections::HashMap<String, u64> =
                    std::collections::HashMap::with_capacity(entries.len());
                for entry in &entries {
                    flushed_max_ts.insert(entry.key.clone(), entry.timestamp);
                }

                flush_compactor
                    .add_flushed_run(run)
                    .map_err(|e| Box::new(e) as crate::memtable::FlushError)?;

                flush_wal
                    .replace_with_filtered(|record| match flushed_max_ts.get(&record.key) {
                        Some(&flushed_ts) => record.timestamp > flushed_ts,
                        None => true,
                    })
                    .map_err(|e| Box::new(e) as crate::memtable::FlushError)?;
                Ok(())
            },
        );

        let records = wal.read_all()?;
        let max_ts = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        for record in &records {
            memtable.put(record.to_entry())?;
        }

        info!(dir = %dir.display(), replayed = records.len(), "store opened");

        Ok(Self {
            wal,
            memtable,
            compactor,
            manifest,
            next_ts: AtomicU64::new(max_ts),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Wall-clock microseconds, clamped to be strictly greater than every
    /// timestamp issued before it (including ones recovered from the WAL).
    fn next_timestamp(&self) -> u64 {
        let wall_clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        loop {
            let prev = self.next_ts.load(Ordering::SeqCst);
            let candidate = wall_clock.max(prev + 1);
            if self
                .next_ts
                .compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Durably stores `value` under `key`, superseding any prior value.
    pub fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_open()?;
        validate_key(key)?;
        validate_value(value)?;

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let ts = self.next_timestamp();
        self.wal.append(&WalRecord::put(key, value, ts))?;
        self.memtable.put(Entry::put(key, value, ts))?;
        Ok(())
    }

    /// Looks up `key`, searching the memtable manager before the
    /// on-disk levels. Returns `Ok(None)` for a missing key or a tombstone.
    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_open()?;
        validate_key(key)?;

        if let Some(entry) = self.memtable.get(key) {
            return Ok(if entry.is_deleted { None } else { entry.value });
        }
        if let Some(entry) = self.compactor.get(key)? {
            return Ok(if entry.is_deleted { None } else { entry.value });
        }
        Ok(None)
    }

    /// Marks `key` as deleted. A subsequent `get` returns `Ok(None)` until
    /// `key` is written again.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_open()?;
        validate_key(key)?;

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let ts = self.next_timestamp();
        self.wal.append(&WalRecord::delete(key, ts))?;
        self.memtable.delete(key, ts)?;
        Ok(())
    }

    /// Forces the active memtable (and any queued immutables) to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.memtable.active_len() == 0 && self.memtable.immutable_len() == 0 {
            return Err(StoreError::NothingToFlush);
        }
        self.memtable.force_flush_all()?;
        Ok(())
    }

    /// Forces a full compaction: every run across every level is merged
    /// into a single new run, with tombstones dropped unconditionally.
    pub fn compact(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.compactor.total_run_count() == 0 {
            return Err(StoreError::NothingToCompact);
        }
        self.compactor.compact(None)?;
        Ok(())
    }

    /// Blocks until no background compaction is in flight, or `timeout`
    /// elapses. Returns `true` if the store went quiescent in time.
    pub fn wait_for_compaction(&self, timeout: Duration) -> bool {
        self.compactor.wait_for_compaction(timeout)
    }

    /// Diagnostic counters (§9); not part of the core read/write contract.
    pub fn stats(&self) -> Stats {
        Stats {
            active_memtable_entries: self.memtable.active_len(),
            active_memtable_bytes: self.memtable.active_memory_bytes(),
            immutable_memtable_count: self.memtable.immutable_len(),
            total_runs: self.compactor.total_run_count(),
            next_sstable_id: self.manifest.global().next_sstable_id(),
        }
    }

    /// Per-level run/entry breakdown (§6).
    pub fn get_level_info(&self) -> Vec<LevelInfo> {
        self.compactor
            .level_info()
            .into_iter()
            .map(|(level, run_count, entry_count)| LevelInfo {
                level,
                run_count,
                entry_count,
            })
            .collect()
    }

    /// Flushes everything, stops background work, and releases every open
    /// file handle. Idempotent: a second call is a no-op.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.memtable.force_flush_all()?;
        self.memtable.close()?;
        self.wal.clear()?;
        self.compactor.shutdown(true, Duration::from_secs(30));
        self.compactor.close_all_runs();
        info!("store closed");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> StoreConfig {
        StoreConfig {
            memtable_size: 4,
            max_immutable_memtables: 2,
            flush_workers: 1,
            max_l0_sstables: 2,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        store.put("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".into()));
    }

    #[test]
    fn overwrite_wins() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        store.put("a", "1").unwrap();
        store.put("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("2".into()));
    }

    #[test]
    fn delete_then_get_is_none() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        store.put("a", "1").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn missing_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn survives_flush_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), small_config()).unwrap();
            store.put("a", "1").unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".into()));
    }

    #[test]
    fn crash_recovery_replays_unflushed_wal() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
            store.put("a", "1").unwrap();
            store.put("b", "2").unwrap();
            // No explicit close/flush: simulates a crash before a graceful shutdown.
            std::mem::forget(store);
        }
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".into()));
        assert_eq!(store.get("b").unwrap(), Some("2".into()));
    }

    #[test]
    fn tombstone_survives_across_a_flush_boundary() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        store.put("a", "1").unwrap();
        store.flush().unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        store.flush().unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn operations_after_close_return_closed_error() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        store.close().unwrap();
        assert!(matches!(store.put("a", "1"), Err(StoreError::Closed)));
        assert!(matches!(store.get("a"), Err(StoreError::Closed)));
    }

    #[test]
    fn flush_with_nothing_pending_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        assert!(matches!(store.flush(), Err(StoreError::NothingToFlush)));
    }

    #[test]
    fn compact_with_no_runs_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        assert!(matches!(store.compact(), Err(StoreError::NothingToCompact)));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        let huge_key = "k".repeat(crate::config::MAX_KEY_BYTES + 1);
        assert!(matches!(
            store.put(&huge_key, "v"),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn background_compaction_does_not_block_writes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        for i in 0..20 {
            store.put(&format!("k{i:04}"), &format!("v{i}")).unwrap();
        }
        assert!(store.wait_for_compaction(Duration::from_secs(5)));
        for i in 0..20 {
            assert_eq!(store.get(&format!("k{i:04}")).unwrap(), Some(format!("v{i}")));
        }
    }
}
