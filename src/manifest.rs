//! Manifest Module
//!
//! Durable bookkeeping of which runs exist on disk (§4.7; C8 the per-level
//! manifest, C9 the global manifest) plus the manager that discovers and
//! coordinates them (C9).
//!
//! # On-disk layout
//!
//! ```text
//! manifests/
//!   level_0.json   { "runs": [ RunMetadata, ... ] }
//!   level_1.json
//!   ...
//!   global.json    { "next_sstable_id": u32, "version": u32, "metadata": {} }
//! ```
//!
//! Every rewrite is atomic: serialise to a sibling `.tmp` file, `fsync`,
//! then `rename` over the primary path, exactly as [`crate::wal::Wal`] does
//! for its own rewrites.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, trace};

use crate::sstable::RunMetadata;

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed manifest at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ManifestError> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)
        .unwrap_or_else(|e| panic!("manifest value must always serialize: {e}"));
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&body)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, ManifestError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ManifestError::Malformed {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LevelManifestFile {
    runs: Vec<RunMetadata>,
}

/// The set of runs that make up one level (§4.7, C8). Every mutating
/// method rewrites the whole file atomically; there is no incremental
/// append format, since a level's run list is small and changes rarely
/// (only on flush or compaction).
pub struct LevelManifest {
    path: PathBuf,
    runs: Mutex<Vec<RunMetadata>>,
}

impl LevelManifest {
    /// Loads `path` if it exists, or starts empty.
    pub fn open(path: PathBuf) -> Result<Self, ManifestError> {
        let runs = read_json::<LevelManifestFile>(&path)?
            .map(|f| f.runs)
            .unwrap_or_default();
        Ok(Self {
            path,
            runs: Mutex::new(runs),
        })
    }

    pub fn runs(&self) -> Vec<RunMetadata> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Appends `metadata` and persists the level.
    pub fn add_sstable(&self, metadata: RunMetadata) -> Result<(), ManifestError> {
        let mut guard = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(metadata);
        atomic_write_json(&self.path, &LevelManifestFile { runs: guard.clone() })?;
        trace!(path = %self.path.display(), count = guard.len(), "level manifest updated");
        Ok(())
    }

    /// Drops every run whose id is in `ids` and persists the level.
    pub fn remove_sstables(&self, ids: &[u32]) -> Result<(), ManifestError> {
        let mut guard = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|r| !ids.contains(&r.sstable_id));
        atomic_write_json(&self.path, &LevelManifestFile { runs: guard.clone() })?;
        Ok(())
    }

    /// Empties the level (used when a level is fully absorbed by compaction).
    pub fn clear_level(&self) -> Result<(), ManifestError> {
        let mut guard = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        guard.clear();
        atomic_write_json(&self.path, &LevelManifestFile { runs: Vec::new() })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GlobalManifestFile {
    next_sstable_id: u32,
    version: u32,
    metadata: BTreeMap<String, String>,
}

impl Default for GlobalManifestFile {
    fn default() -> Self {
        Self {
            next_sstable_id: 0,
            version: 1,
            metadata: BTreeMap::new(),
        }
    }
}

/// Store-wide state that does not belong to any single level (§4.7, C9):
/// the monotonic run-ID counter and a small open metadata bag.
pub struct GlobalManifest {
    path: PathBuf,
    state: Mutex<GlobalManifestFile>,
    next_id_cache: AtomicU32,
}

impl GlobalManifest {
    pub fn open(path: PathBuf) -> Result<Self, ManifestError> {
        let state = read_json::<GlobalManifestFile>(&path)?.unwrap_or_default();
        let next_id_cache = AtomicU32::new(state.next_sstable_id);
        Ok(Self {
            path,
            state: Mutex::new(state),
            next_id_cache,
        })
    }

    pub fn next_sstable_id(&self) -> u32 {
        self.next_id_cache.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u32 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).version
    }

    /// Allocates and persists the next run ID, returning the one just
    /// allocated.
    pub fn allocate_id(&self) -> Result<u32, ManifestError> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let id = guard.next_sstable_id;
        guard.next_sstable_id += 1;
        self.next_id_cache.store(guard.next_sstable_id, Ordering::SeqCst);
        atomic_write_json(&self.path, &*guard)?;
        Ok(id)
    }

    /// Overwrites the next-id counter directly (crash recovery: the counter
    /// must never regress below any id already observed on disk).
    pub fn set_next_id_at_least(&self, candidate: u32) -> Result<(), ManifestError> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if candidate > guard.next_sstable_id {
            guard.next_sstable_id = candidate;
            self.next_id_cache.store(candidate, Ordering::SeqCst);
            atomic_write_json(&self.path, &*guard)?;
        }
        Ok(())
    }
}

/// Discovers and owns every [`LevelManifest`] plus the single
/// [`GlobalManifest`] for a store directory (§4.7, C9).
pub struct ManifestManager {
    dir: PathBuf,
    global: GlobalManifest,
    levels: Mutex<BTreeMap<usize, std::sync::Arc<LevelManifest>>>,
}

impl ManifestManager {
    /// Opens (or initialises) `manifests/` under `store_dir`, discovering
    /// any existing `level_<N>.json` files.
    pub fn open(store_dir: &Path) -> Result<Self, ManifestError> {
        let dir = store_dir.join("manifests");
        fs::create_dir_all(&dir)?;

        let global = GlobalManifest::open(dir.join("global.json"))?;

        let mut levels = BTreeMap::new();
        if let Ok(read_dir) = fs::read_dir(&dir) {
            for entry in read_dir.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(level) = parse_level_filename(&name) {
                    let manifest = LevelManifest::open(dir.join(name.as_ref()))?;
                    levels.insert(level, std::sync::Arc::new(manifest));
                }
            }
        }

        info!(levels = levels.len(), "manifest manager opened");
        Ok(Self {
            dir,
            global,
            levels: Mutex::new(levels),
        })
    }

    fn level_path(&self, level: usize) -> PathBuf {
        self.dir.join(format!("level_{level}.json"))
    }

    /// Returns the manifest for `level`, creating an empty one on first use.
    pub fn level(&self, level: usize) -> Result<std::sync::Arc<LevelManifest>, ManifestError> {
        let mut guard = self.levels.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = guard.get(&level) {
            return Ok(std::sync::Arc::clone(existing));
        }
        let manifest = std::sync::Arc::new(LevelManifest::open(self.level_path(level))?);
        guard.insert(level, std::sync::Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Levels that currently have a manifest on disk, ascending.
    pub fn known_levels(&self) -> Vec<usize> {
        self.levels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn add_sstable(&self, level: usize, metadata: RunMetadata) -> Result<(), ManifestError> {
        self.level(level)?.add_sstable(metadata)
    }

    pub fn remove_sstables(&self, level: usize, ids: &[u32]) -> Result<(), ManifestError> {
        self.level(level)?.remove_sstables(ids)
    }

    pub fn global(&self) -> &GlobalManifest {
        &self.global
    }

    pub fn allocate_id(&self) -> Result<u32, ManifestError> {
        self.global.allocate_id()
    }
}

fn parse_level_filename(name: &str) -> Option<usize> {
    name.strip_prefix("level_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(id: u32, level: usize) -> RunMetadata {
        RunMetadata {
            sstable_id: id,
            dirname: RunMetadata::dirname_for(id),
            num_entries: 1,
            min_key: format!("k{id}"),
            max_key: format!("k{id}"),
            level,
        }
    }

    #[test]
    fn level_manifest_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("level_0.json");
        {
            let manifest = LevelManifest::open(path.clone()).unwrap();
            manifest.add_sstable(run(0, 0)).unwrap();
            manifest.add_sstable(run(1, 0)).unwrap();
        }
        let reopened = LevelManifest::open(path).unwrap();
        assert_eq!(reopened.runs().len(), 2);
    }

    #[test]
    fn level_manifest_remove_sstables_drops_matching_ids() {
        let dir = TempDir::new().unwrap();
        let manifest = LevelManifest::open(dir.path().join("level_0.json")).unwrap();
        manifest.add_sstable(run(0, 0)).unwrap();
        manifest.add_sstable(run(1, 0)).unwrap();
        manifest.remove_sstables(&[0]).unwrap();
        let ids: Vec<u32> = manifest.runs().iter().map(|r| r.sstable_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn global_manifest_allocates_monotonic_ids() {
        let dir = TempDir::new().unwrap();
        let global = GlobalManifest::open(dir.path().join("global.json")).unwrap();
        assert_eq!(global.allocate_id().unwrap(), 0);
        assert_eq!(global.allocate_id().unwrap(), 1);
        assert_eq!(global.next_sstable_id(), 2);
    }

    #[test]
    fn global_manifest_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global.json");
        {
            let global = GlobalManifest::open(path.clone()).unwrap();
            global.allocate_id().unwrap();
            global.allocate_id().unwrap();
        }
        let reopened = GlobalManifest::open(path).unwrap();
        assert_eq!(reopened.next_sstable_id(), 2);
    }

    #[test]
    fn manager_discovers_existing_level_files_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let manager = ManifestManager::open(dir.path()).unwrap();
            manager.add_sstable(0, run(0, 0)).unwrap();
            manager.add_sstable(1, run(1, 1)).unwrap();
        }
        let manager = ManifestManager::open(dir.path()).unwrap();
        let mut levels = manager.known_levels();
        levels.sort_unstable();
        assert_eq!(levels, vec![0, 1]);
        assert_eq!(manager.level(0).unwrap().runs().len(), 1);
    }

    #[test]
    fn set_next_id_at_least_never_regresses() {
        let dir = TempDir::new().unwrap();
        let global = GlobalManifest::open(dir.path().join("global.json")).unwrap();
        global.set_next_id_at_least(5).unwrap();
        assert_eq!(global.next_sstable_id(), 5);
        global.set_next_id_at_least(3).unwrap();
        assert_eq!(global.next_sstable_id(), 5);
    }
}
