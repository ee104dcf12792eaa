//! Compaction Module
//!
//! The leveled SSTable manager (§4.8, C10): owns every run on disk, answers
//! point lookups across levels, and drives the background merge process
//! that keeps each level's size bounded.
//!
//! # Level layout
//!
//! Level 0 holds the most recently flushed runs; their key ranges may
//! overlap, so a lookup walks L0 newest-first. Level 1 and deeper are each
//! kept as a single merged, non-overlapping run set — a lookup touches at
//! most one run per level there. `get` therefore walks levels in ascending
//! order, L0 newest-first, returning the first match (a tombstone is still
//! a match: it shadows anything older).
//!
//! # Compaction
//!
//! A level becomes eligible once it crosses `soft_limit_ratio *
//! max_entries(level)` (L0 instead trips on a run *count*,
//! `max_l0_sstables`). Background compaction of level `L` merges every run
//! in `L` with every run in `L + 1` into one new run published to `L + 1`;
//! tombstones are dropped only when `L + 1` is the bottommost level the
//! store currently has any data in, then cascades into `L + 1` if that
//! level is now itself eligible. Publication is snapshot-isolated: the
//! merge reads a point-in-time view of the levels' run lists, and only
//! that exact snapshot is retired when the result is published, so a
//! concurrent flush landing in a level during the merge is not lost.
//!
//! A manual, full `compact()` is a separate operation: it collects every
//! run across every level in one pass, drops tombstones unconditionally
//! (the result is the bottommost state of the whole store by definition),
//! and publishes a single new run — it does not reuse the pairwise,
//! eligibility-gated cascade above, since that can stop partway through
//! the tree and leave deeper levels untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{info, trace, warn};

use crate::entry::Entry;
use crate::manifest::{ManifestError, ManifestManager};
use crate::sstable::{LazyRun, Run, RunMetadata, SstableError};

/// Errors raised while compacting or reading runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompactionError {
    #[error("run I/O error: {0}")]
    Run(#[from] SstableError),

    #[error("manifest I/O error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Level-sizing knobs (§4.8; mirrors the relevant fields of
/// [`crate::config::StoreConfig`]).
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub level_ratio: f64,
    pub base_level_entries: usize,
    pub max_l0_sstables: usize,
    pub soft_limit_ratio: f64,
    pub sparse_index_block_size: usize,
    pub bloom_false_positive_rate: f64,
}

/// `base_level_entries * level_ratio^level`, undefined (and unused) for L0,
/// which is governed by run count instead of entry count.
fn max_entries(level: usize, cfg: &CompactionConfig) -> usize {
    debug_assert!(level >= 1);
    (cfg.base_level_entries as f64 * cfg.level_ratio.powi(level as i32)).round() as usize
}

fn soft_limit(level: usize, cfg: &CompactionConfig) -> usize {
    ((max_entries(level, cfg) as f64) * cfg.soft_limit_ratio).round() as usize
}

struct LevelState {
    runs: RwLock<std::collections::BTreeMap<usize, Vec<Arc<LazyRun>>>>,
}

struct Inner {
    dir: PathBuf,
    manifest: Arc<ManifestManager>,
    config: CompactionConfig,
    levels: LevelState,
    compacting: Mutex<HashSet<usize>>,
    in_flight: AtomicUsize,
    quiescent: Condvar,
    quiescent_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Inner {
    fn level_entry_count(&self, level: usize) -> usize {
        self.levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&level)
            .map(|runs| runs.iter().map(|r| r.metadata().num_entries).sum())
            .unwrap_or(0)
    }

    fn level_run_count(&self, level: usize) -> usize {
        self.levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&level)
            .map(|runs| runs.len())
            .unwrap_or(0)
    }

    fn is_eligible(&self, level: usize) -> bool {
        if level == 0 {
            self.level_run_count(0) >= self.config.max_l0_sstables
        } else {
            self.level_entry_count(level) > soft_limit(level, &self.config)
        }
    }

    fn deepest_level_with_data(&self) -> usize {
        self.levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, runs)| !runs.is_empty())
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(0)
    }

    /// Merges all of `level` with all of `level + 1`, publishing one new
    /// run at `level + 1`. Returns `Ok(true)` if `level + 1` is now itself
    /// eligible (cascade), `Ok(false)` otherwise.
    fn compact_into_next(&self, level: usize) -> Result<bool, CompactionError> {
        let target = level + 1;

        let (src_snapshot, dst_snapshot) = {
            let guard = self.levels.runs.read().unwrap_or_else(|p| p.into_inner());
            (
                guard.get(&level).cloned().unwrap_or_default(),
                guard.get(&target).cloned().unwrap_or_default(),
            )
        };
        if src_snapshot.is_empty() {
            return Ok(false);
        }

        let bottommost = target >= self.deepest_level_with_data();

        let mut merged: std::collections::BTreeMap<String, Entry> = std::collections::BTreeMap::new();
        for run in src_snapshot.iter().chain(dst_snapshot.iter()) {
            for entry in run.read_all()? {
                match merged.get(&entry.key) {
                    Some(existing) if existing.timestamp >= entry.timestamp => {}
                    _ => {
                        merged.insert(entry.key.clone(), entry);
                    }
                }
            }
        }
        if bottommost {
            merged.retain(|_, e| !e.is_deleted);
        }

        let dropped_src: Vec<u32> = src_snapshot.iter().map(|r| r.metadata().sstable_id).collect();
        let dropped_dst: Vec<u32> = dst_snapshot.iter().map(|r| r.metadata().sstable_id).collect();

        if merged.is_empty() {
            // Every entry was a dropped tombstone: retire the inputs, publish nothing.
            self.retire(level, &dropped_src, target, &dropped_dst, None)?;
            return Ok(false);
        }

        let entries: Vec<Entry> = merged.into_values().collect();
        let new_id = self.manifest.allocate_id()?;
        let new_run = Run::write(
            &self.dir,
            new_id,
            target,
            &entries,
            self.config.sparse_index_block_size,
            self.config.bloom_false_positive_rate,
        )?;
        let new_metadata = new_run.metadata().clone();
        let lazy = Arc::new(LazyRun::loaded(
            self.dir.join(&new_metadata.dirname),
            new_metadata.clone(),
            new_run,
        ));

        self.retire(level, &dropped_src, target, &dropped_dst, Some((lazy, new_metadata)))?;

        info!(
            from = level,
            to = target,
            merged_entries = entries_len_hint(&dropped_src, &dropped_dst),
            "compaction published"
        );
        Ok(self.is_eligible(target))
    }

    fn retire(
        &self,
        src_level: usize,
        src_ids: &[u32],
        dst_level: usize,
        dst_ids: &[u32],
        publish: Option<(Arc<LazyRun>, RunMetadata)>,
    ) -> Result<(), CompactionError> {
        let (retired_src, retired_dst) = {
            let mut guard = self.levels.runs.write().unwrap_or_else(|p| p.into_inner());

            let src_runs = guard.entry(src_level).or_default();
            let mut retired_src = Vec::new();
            src_runs.retain(|r| {
                if src_ids.contains(&r.metadata().sstable_id) {
                    retired_src.push(Arc::clone(r));
                    false
                } else {
                    true
                }
            });

            let dst_runs = guard.entry(dst_level).or_default();
            let mut retired_dst = Vec::new();
            dst_runs.retain(|r| {
                if dst_ids.contains(&r.metadata().sstable_id) {
                    retired_dst.push(Arc::clone(r));
                    false
                } else {
                    true
                }
            });
            if let Some((lazy, _)) = &publish {
                dst_runs.push(Arc::clone(lazy));
            }
            (retired_src, retired_dst)
        };

        self.manifest.remove_sstables(src_level, src_ids)?;
        self.manifest.remove_sstables(dst_level, dst_ids)?;
        if let Some((_, metadata)) = publish {
            self.manifest.add_sstable(dst_level, metadata)?;
        }

        for run in retired_src.into_iter().chain(retired_dst) {
            if let Err(e) = run.delete() {
                warn!(error = %e, "failed to delete retired run file, leaking on disk");
            }
        }
        Ok(())
    }

    /// Collects every run across every level, merges with max-timestamp
    /// wins, drops tombstones unconditionally, and publishes a single new
    /// run — retiring every input run across every level it came from.
    ///
    /// `target_level` defaults to the highest existing level, or L1 if
    /// only L0 currently holds any data.
    fn compact_full(&self, target_level: Option<usize>) -> Result<(), CompactionError> {
        let snapshot = self
            .levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let mut merged: std::collections::BTreeMap<String, Entry> = std::collections::BTreeMap::new();
        for runs in snapshot.values() {
            for run in runs {
                for entry in run.read_all()? {
                    match merged.get(&entry.key) {
                        Some(existing) if existing.timestamp >= entry.timestamp => {}
                        _ => {
                            merged.insert(entry.key.clone(), entry);
                        }
                    }
                }
            }
        }
        merged.retain(|_, e| !e.is_deleted);

        let deepest = snapshot
            .iter()
            .filter(|(_, runs)| !runs.is_empty())
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(0);
        let target = target_level.unwrap_or(if deepest == 0 { 1 } else { deepest });

        let publish = if merged.is_empty() {
            None
        } else {
            let entries: Vec<Entry> = merged.into_values().collect();
            let new_id = self.manifest.allocate_id()?;
            let new_run = Run::write(
                &self.dir,
                new_id,
                target,
                &entries,
                self.config.sparse_index_block_size,
                self.config.bloom_false_positive_rate,
            )?;
            let new_metadata = new_run.metadata().clone();
            let lazy = Arc::new(LazyRun::loaded(
                self.dir.join(&new_metadata.dirname),
                new_metadata.clone(),
                new_run,
            ));
            Some((lazy, new_metadata))
        };

        let published_entries = publish.as_ref().map(|(_, m)| m.num_entries).unwrap_or(0);
        self.retire_all(&snapshot, target, publish)?;

        info!(target_level = target, published_entries, "full compaction published");
        Ok(())
    }

    /// Removes every run named in `snapshot` (spanning potentially many
    /// levels) from memory and the manifests, optionally publishing one new
    /// run at `target_level`, then deletes the retired runs' directories.
    fn retire_all(
        &self,
        snapshot: &std::collections::BTreeMap<usize, Vec<Arc<LazyRun>>>,
        target_level: usize,
        publish: Option<(Arc<LazyRun>, RunMetadata)>,
    ) -> Result<(), CompactionError> {
        let mut retired = Vec::new();
        {
            let mut guard = self.levels.runs.write().unwrap_or_else(|p| p.into_inner());
            for (level, snap_runs) in snapshot {
                let ids: HashSet<u32> = snap_runs.iter().map(|r| r.metadata().sstable_id).collect();
                if ids.is_empty() {
                    continue;
                }
                let level_runs = guard.entry(*level).or_default();
                level_runs.retain(|r| {
                    if ids.contains(&r.metadata().sstable_id) {
                        retired.push(Arc::clone(r));
                        false
                    } else {
                        true
                    }
                });
            }
            if let Some((lazy, _)) = &publish {
                guard.entry(target_level).or_default().push(Arc::clone(lazy));
            }
        }

        for (level, snap_runs) in snapshot {
            let ids: Vec<u32> = snap_runs.iter().map(|r| r.metadata().sstable_id).collect();
            if !ids.is_empty() {
                self.manifest.remove_sstables(*level, &ids)?;
            }
        }
        if let Some((_, metadata)) = publish {
            self.manifest.add_sstable(target_level, metadata)?;
        }

        for run in retired {
            if let Err(e) = run.delete() {
                warn!(error = %e, "failed to delete retired run file, leaking on disk");
            }
        }
        Ok(())
    }
}

fn entries_len_hint(src: &[u32], dst: &[u32]) -> usize {
    src.len() + dst.len()
}

/// Owns every run on disk and drives background leveled compaction.
pub struct Compactor {
    inner: Arc<Inner>,
    sender: Sender<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub fn new(dir: PathBuf, manifest: Arc<ManifestManager>, config: CompactionConfig) -> Result<Self, CompactionError> {
        let mut levels = std::collections::BTreeMap::new();
        for level in manifest.known_levels() {
            let runs: Vec<Arc<LazyRun>> = manifest
                .level(level)?
                .runs()
                .into_iter()
                .map(|metadata| {
                    let run_dir = dir.join(&metadata.dirname);
                    Arc::new(LazyRun::unloaded(run_dir, metadata))
                })
                .collect();
            levels.insert(level, runs);
        }

        let inner = Arc::new(Inner {
            dir,
            manifest,
            config,
            levels: LevelState {
                runs: RwLock::new(levels),
            },
            compacting: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            quiescent: Condvar::new(),
            quiescent_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let (sender, receiver) = channel::unbounded();
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("lsmkv-compaction".into())
            .spawn(move || worker_loop(worker_inner, receiver))
            .expect("failed to spawn compaction worker thread");

        Ok(Self {
            inner,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Publishes a freshly flushed memtable as a new L0 run and checks
    /// whether L0 has become eligible for compaction.
    pub fn add_flushed_run(&self, run: Run) -> Result<(), CompactionError> {
        let metadata = run.metadata().clone();
        let lazy = Arc::new(LazyRun::loaded(self.inner.dir.join(&metadata.dirname), metadata.clone(), run));
        {
            let mut guard = self.inner.levels.runs.write().unwrap_or_else(|p| p.into_inner());
            guard.entry(0).or_default().push(lazy);
        }
        self.inner.manifest.add_sstable(0, metadata)?;
        if self.inner.is_eligible(0) {
            let _ = self.sender.send(0);
        }
        Ok(())
    }

    /// Newest-first within L0, then ascending through deeper levels.
    pub fn get(&self, key: &str) -> Result<Option<Entry>, CompactionError> {
        let snapshot = self
            .inner
            .levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        if let Some(l0) = snapshot.get(&0) {
            for run in l0.iter().rev() {
                if let Some(entry) = run.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        for (level, runs) in snapshot.iter() {
            if *level == 0 {
                continue;
            }
            for run in runs {
                if let Some(entry) = run.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Synchronously runs a full compaction: every run across every level
    /// is merged into one new run, tombstones are dropped unconditionally,
    /// and every previous run is retired.
    /// `target_level` defaults (on `None`) to the highest existing level,
    /// or L1 if only L0 currently holds data.
    pub fn compact(&self, target_level: Option<usize>) -> Result<(), CompactionError> {
        self.inner.compact_full(target_level)
    }

    /// Waits until no compaction is in flight, or `timeout` elapses.
    /// Returns `true` if the system went quiescent before the timeout.
    pub fn wait_for_compaction(&self, timeout: Duration) -> bool {
        let guard = self.inner.quiescent_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
            return true;
        }
        let (_guard, result) = self
            .inner
            .quiescent
            .wait_timeout_while(guard, timeout, |_| self.inner.in_flight.load(Ordering::SeqCst) > 0)
            .unwrap_or_else(|p| p.into_inner());
        !result.timed_out()
    }

    /// Total number of runs across every level, used for store-wide stats.
    pub fn total_run_count(&self) -> usize {
        self.inner
            .levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// Per-level breakdown for `Store::get_level_info`.
    pub fn level_info(&self) -> Vec<(usize, usize, usize)> {
        self.inner
            .levels
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(level, runs)| {
                let entries: usize = runs.iter().map(|r| r.metadata().num_entries).sum();
                (*level, runs.len(), entries)
            })
            .collect()
    }

    /// Stops accepting new background work and joins the worker thread.
    /// `wait` requests the worker finish any in-flight compaction first;
    /// `timeout` bounds how long `wait_for_compaction` blocks beforehand.
    pub fn shutdown(&self, wait: bool, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if wait {
            self.wait_for_compaction(timeout);
        }
        drop(self.sender.clone());
        if let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = handle.join();
        }
    }

    /// Closes every loaded run so file handles and mappings are released.
    pub fn close_all_runs(&self) {
        let guard = self.inner.levels.runs.read().unwrap_or_else(|p| p.into_inner());
        for runs in guard.values() {
            for run in runs {
                run.unload();
            }
        }
    }
}

fn worker_loop(inner: Arc<Inner>, receiver: Receiver<usize>) {
    for level in receiver.iter() {
        let mut current = level;
        loop {
            if inner.compacting.lock().unwrap_or_else(|p| p.into_inner()).contains(&current) {
                break;
            }
            if !inner.is_eligible(current) {
                break;
            }
            inner.compacting.lock().unwrap_or_else(|p| p.into_inner()).insert(current);
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            trace!(level = current, "background compaction starting");

            let result = inner.compact_into_next(current);

            inner.compacting.lock().unwrap_or_else(|p| p.into_inner()).remove(&current);
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _lock = inner.quiescent_lock.lock().unwrap_or_else(|p| p.into_inner());
                inner.quiescent.notify_all();
            }

            match result {
                Ok(true) => current += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(level = current, error = %e, "compaction failed, aborting cascade");
                    break;
                }
            }
        }
    }
}
