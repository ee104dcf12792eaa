//! Run (SSTable) Module
//!
//! An immutable, sorted, on-disk run of [`Entry`] values, plus the lazy
//! wrapper that defers every byte of I/O until a run is first touched
//! (§4.3, §4.4; C4, C5).
//!
//! # On-disk layout
//!
//! ```text
//! sstable_<6-digit-id>/
//!   data.db            JSON lines, one Entry each, ascending key order
//!   bloom_filter.bf     file-backed bloom filter over the run's keys
//!   sparse_index.idx    binary: every Nth key's (key, byte offset)
//! ```
//!
//! # Point lookup
//!
//! 1. [`LazyRun::get`] short-circuits on the run's `[min_key, max_key]`
//!    range *without loading anything*.
//! 2. The bloom filter rules out definite absence.
//! 3. The sparse index bounds the scan to one ≈block-sized window.
//! 4. That window is read from a memory-mapped `data.db`, line by line,
//!    stopping early once a parsed key exceeds the target (entries are
//!    sorted).
//!
//! Every one of these resources — bloom filter, sparse index, `mmap` — is
//! loaded at most once, on first use, behind a lock-guarded slot so
//! concurrent first-touches never race (§4.3, §4.4, §9 "double-checked
//! initialization").

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, trace, warn};

use crate::bloom::BloomFilter;
use crate::entry::Entry;
use crate::sparse_index::SparseIndex;

/// Errors returned by run read/write operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SstableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot write a run from an empty entry set")]
    EmptyInput,

    #[error("corrupt run entry on line {line}: {source}")]
    CorruptEntry {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity and bounds of a run, independent of whether it is loaded (§3).
/// This is exactly what a level manifest persists per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub sstable_id: u32,
    pub dirname: String,
    pub num_entries: usize,
    pub min_key: String,
    pub max_key: String,
    pub level: usize,
}

impl RunMetadata {
    /// `sstable_<6-digit-zero-padded-id>`.
    pub fn dirname_for(id: u32) -> String {
        format!("sstable_{id:06}")
    }

    fn in_range(&self, key: &str) -> bool {
        key >= self.min_key.as_str() && key <= self.max_key.as_str()
    }
}

/// A lock-guarded, lazily-populated slot shared by reference-counted
/// readers. `get_or_try_init` is the double-checked-init entry point;
/// `unload` drops the cached value without forgetting how to rebuild it.
#[derive(Debug)]
struct LazySlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> LazySlot<T> {
    fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn preloaded(value: T) -> Self {
        Self {
            inner: Mutex::new(Some(Arc::new(value))),
        }
    }

    fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(v) = guard.as_ref() {
            return Ok(Arc::clone(v));
        }
        let v = Arc::new(init()?);
        *guard = Some(Arc::clone(&v));
        Ok(v)
    }

    fn unload(&self) {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn is_loaded(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

#[derive(Debug)]
struct MappedData {
    // Held only to keep the file descriptor backing `mmap` alive.
    _file: File,
    mmap: Mmap,
}

/// A fully-constructed run, with bloom filter, sparse index, and the data
/// file's `mmap` loaded independently and lazily (§4.3).
#[derive(Debug)]
pub struct Run {
    dir: PathBuf,
    metadata: RunMetadata,
    bloom: LazySlot<BloomFilter>,
    sparse_index: LazySlot<SparseIndex>,
    mapped: LazySlot<MappedData>,
}

impl Run {
    fn bloom_path(dir: &Path) -> PathBuf {
        dir.join("bloom_filter.bf")
    }
    fn sparse_index_path(dir: &Path) -> PathBuf {
        dir.join("sparse_index.idx")
    }
    fn data_path(dir: &Path) -> PathBuf {
        dir.join("data.db")
    }

    /// Writes `entries` (already key-sorted) as a new run under
    /// `parent_dir`, fully materialising the bloom filter, sparse index,
    /// and data file (§4.3 "write path"). Fails on an empty input.
    pub fn write(
        parent_dir: &Path,
        sstable_id: u32,
        level: usize,
        entries: &[Entry],
        block_size: usize,
        bloom_false_positive_rate: f64,
    ) -> Result<Run, SstableError> {
        if entries.is_empty() {
            return Err(SstableError::EmptyInput);
        }

        let dirname = RunMetadata::dirname_for(sstable_id);
        let dir = parent_dir.join(&dirname);
        fs::create_dir_all(&dir)?;

        let mut bloom = BloomFilter::new(entries.len(), bloom_false_positive_rate);
        let mut sparse_index = SparseIndex::new(block_size);

        let mut file = File::create(Self::data_path(&dir))?;
        let mut offset: u64 = 0;
        for (i, entry) in entries.iter().enumerate() {
            if i % block_size == 0 {
                sparse_index.push(entry.key.clone(), offset);
            }
            bloom.add(&entry.key);

            let mut line = serde_json::to_string(entry)
                .unwrap_or_else(|e| panic!("Entry must always serialize: {e}"));
            line.push('\n');
            io::Write::write_all(&mut file, line.as_bytes())?;
            offset += line.len() as u64;
        }
        file.sync_all()?;

        bloom.save_to_file(Self::bloom_path(&dir))?;
        bloom.close()?;
        sparse_index.save_to_file(Self::sparse_index_path(&dir))?;

        let metadata = RunMetadata {
            sstable_id,
            dirname,
            num_entries: entries.len(),
            min_key: entries[0].key.clone(),
            max_key: entries[entries.len() - 1].key.clone(),
            level,
        };

        info!(
            id = sstable_id,
            entries = metadata.num_entries,
            dir = %dir.display(),
            "run written"
        );

        Ok(Run {
            dir,
            metadata,
            bloom: LazySlot::preloaded(bloom),
            sparse_index: LazySlot::preloaded(sparse_index),
            mapped: LazySlot::empty(),
        })
    }

    /// Wraps an already-written run directory without loading anything.
    pub fn open(dir: PathBuf, metadata: RunMetadata) -> Run {
        Run {
            dir,
            metadata,
            bloom: LazySlot::empty(),
            sparse_index: LazySlot::empty(),
            mapped: LazySlot::empty(),
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    fn bloom(&self) -> Result<Arc<BloomFilter>, SstableError> {
        let dir = &self.dir;
        Ok(self.bloom
            .get_or_try_init(|| BloomFilter::load_from_file(Self::bloom_path(dir)))?)
    }

    fn sparse_index(&self) -> Result<Arc<SparseIndex>, SstableError> {
        let dir = &self.dir;
        Ok(self.sparse_index
            .get_or_try_init(|| SparseIndex::load_from_file(Self::sparse_index_path(dir)))?)
    }

    fn mapped(&self) -> Result<Arc<MappedData>, SstableError> {
        let dir = &self.dir;
        Ok(self.mapped.get_or_try_init(|| {
            let file = File::open(Self::data_path(dir))?;
            // SAFETY: `data.db` is append-only and owned exclusively by this
            // store process once published; it is never truncated or
            // rewritten in place while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            Ok::<_, io::Error>(MappedData { _file: file, mmap })
        })?)
    }

    /// Point lookup (§4.3 "read path").
    pub fn get(&self, key: &str) -> Result<Option<Entry>, SstableError> {
        if !self.metadata.in_range(key) {
            return Ok(None);
        }

        let bloom = self.bloom()?;
        if !bloom.might_contain(key) {
            return Ok(None);
        }

        let sparse_index = self.sparse_index()?;
        let (start, end) = sparse_index.get_scan_range(key);

        let mapped = self.mapped()?;
        let file_len = mapped.mmap.len() as u64;
        let end = end.unwrap_or(file_len).min(file_len);
        let start = start.min(end);

        let window = &mapped.mmap[start as usize..end as usize];
        for (lineno, line) in window.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry: Entry = match serde_json::from_slice(line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(run = self.metadata.sstable_id, line = lineno, error = %e, "skipping corrupt run line");
                    continue;
                }
            };
            match entry.key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => continue,
            }
        }
        Ok(None)
    }

    /// Reads and parses every entry in the run, in key order. Used by
    /// compaction (§4.3).
    pub fn read_all(&self) -> Result<Vec<Entry>, SstableError> {
        let mapped = self.mapped()?;
        let mut out = Vec::with_capacity(self.metadata.num_entries);
        for (lineno, line) in mapped.mmap.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Entry>(line) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(run = self.metadata.sstable_id, line = lineno, error = %e, "skipping corrupt run line"),
            }
        }
        Ok(out)
    }

    /// Closes the bloom filter (fsync if file-backed) and releases the
    /// mapping and file handle (§4.3).
    pub fn close(&self) -> Result<(), SstableError> {
        if let Some(bloom) = self.bloom.inner.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            bloom.close()?;
        }
        self.bloom.unload();
        self.sparse_index.unload();
        self.mapped.unload();
        Ok(())
    }

    /// Closes, then removes the run's directory tree.
    pub fn delete(&self) -> Result<(), SstableError> {
        self.close()?;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        trace!(id = self.metadata.sstable_id, "run deleted");
        Ok(())
    }
}

/// Holds run metadata and a lazily-materialised [`Run`] (§4.4).
///
/// `get` short-circuits on the metadata key range before any load is
/// attempted. `access_count` is a diagnostic counter, not load-bearing for
/// correctness.
pub struct LazyRun {
    dir: PathBuf,
    metadata: RunMetadata,
    run: Mutex<Option<Arc<Run>>>,
    access_count: AtomicU64,
}

impl LazyRun {
    /// Wraps a run directory that has not been read into memory yet.
    pub fn unloaded(dir: PathBuf, metadata: RunMetadata) -> Self {
        Self {
            dir,
            metadata,
            run: Mutex::new(None),
            access_count: AtomicU64::new(0),
        }
    }

    /// Wraps a run that was just written and is already fully in memory —
    /// used right after [`Run::write`] so the freshly published run does
    /// not pay a reload round-trip.
    pub fn loaded(dir: PathBuf, metadata: RunMetadata, run: Run) -> Self {
        Self {
            dir,
            metadata,
            run: Mutex::new(Some(Arc::new(run))),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn ensure_loaded(&self) -> Result<Arc<Run>, SstableError> {
        let mut guard = self.run.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(run) = guard.as_ref() {
            return Ok(Arc::clone(run));
        }
        let run = Arc::new(Run::open(self.dir.clone(), self.metadata.clone()));
        *guard = Some(Arc::clone(&run));
        Ok(run)
    }

    /// Point lookup with the metadata-range short-circuit of §4.4.
    pub fn get(&self, key: &str) -> Result<Option<Entry>, SstableError> {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        if !self.metadata.in_range(key) {
            return Ok(None);
        }
        self.ensure_loaded()?.get(key)
    }

    /// Reads every entry, loading the run if necessary.
    pub fn read_all(&self) -> Result<Vec<Entry>, SstableError> {
        self.ensure_loaded()?.read_all()
    }

    /// Drops the loaded [`Run`], retaining metadata for later re-materialisation.
    pub fn unload(&self) {
        let mut guard = self.run.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(run) = guard.take() {
            let _ = run.close();
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Closes and removes the run's on-disk directory.
    pub fn delete(&self) -> Result<(), SstableError> {
        let run = self.ensure_loaded()?;
        run.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| Entry::put(format!("k{i:04}"), format!("v{i}"), i as u64))
            .collect()
    }

    #[test]
    fn write_then_get_every_key() {
        let dir = TempDir::new().unwrap();
        let run = Run::write(dir.path(), 0, 0, &entries(20), 4, 0.01).unwrap();
        for i in 0..20 {
            let got = run.get(&format!("k{i:04}")).unwrap();
            assert_eq!(got.unwrap().value, Some(format!("v{i}")));
        }
        assert!(run.get("zzzz").unwrap().is_none());
    }

    #[test]
    fn write_rejects_empty_input() {
        let dir = TempDir::new().unwrap();
        let err = Run::write(dir.path(), 0, 0, &[], 4, 0.01).unwrap_err();
        assert!(matches!(err, SstableError::EmptyInput));
    }

    #[test]
    fn out_of_range_key_short_circuits_without_io() {
        let dir = TempDir::new().unwrap();
        let run = Run::write(dir.path(), 0, 0, &entries(10), 4, 0.01).unwrap();
        assert!(run.get("zzzz-past-max").unwrap().is_none());
        assert!(run.get("0-before-min").unwrap().is_none());
    }

    #[test]
    fn lazy_wrapper_loads_on_first_touch_and_can_unload() {
        let dir = TempDir::new().unwrap();
        let written = Run::write(dir.path(), 0, 0, &entries(10), 4, 0.01).unwrap();
        let metadata = written.metadata().clone();
        drop(written);

        let lazy = LazyRun::unloaded(dir.path().join(&metadata.dirname), metadata);
        assert!(!lazy.is_loaded());
        assert_eq!(lazy.get("k0005").unwrap().unwrap().value, Some("v5".into()));
        assert!(lazy.is_loaded());

        lazy.unload();
        assert!(!lazy.is_loaded());
        // Still answers correctly after reload from disk.
        assert_eq!(lazy.get("k0005").unwrap().unwrap().value, Some("v5".into()));
    }

    #[test]
    fn read_all_returns_entries_in_key_order() {
        let dir = TempDir::new().unwrap();
        let run = Run::write(dir.path(), 0, 0, &entries(5), 4, 0.01).unwrap();
        let all = run.read_all().unwrap();
        let keys: Vec<&str> = all.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["k0000", "k0001", "k0002", "k0003", "k0004"]);
    }

    #[test]
    fn delete_removes_directory() {
        let dir = TempDir::new().unwrap();
        let run = Run::write(dir.path(), 0, 0, &entries(3), 4, 0.01).unwrap();
        let run_dir = dir.path().join(&run.metadata().dirname);
        assert!(run_dir.exists());
        run.delete().unwrap();
        assert!(!run_dir.exists());
    }
}
