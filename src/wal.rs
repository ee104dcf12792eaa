//! Write-Ahead Log (WAL) Module
//!
//! Durable, append-only log of `PUT`/`DELETE` operations that makes writes
//! survive a crash before they ever reach a memtable flush (§4.1).
//!
//! # On-disk layout
//!
//! One JSON object per line, self-delimited by the newline (§6):
//!
//! ```text
//! {"op":"PUT","key":"k","value":"v","ts":1}
//! {"op":"DELETE","key":"k","value":null,"ts":2}
//! ```
//!
//! # Concurrency model
//!
//! A single [`std::sync::Mutex`] around the file handle serialises
//! `append`, `read_all`, `clear`, and `replace_with_filtered` (§4.1, §5).
//! There is no parallelism inside the WAL: `replace_with_filtered` must
//! observe a consistent view of the file relative to concurrent appends,
//! so every operation takes the same lock.
//!
//! # Guarantees
//!
//! - **Durability:** every [`Wal::append`] is followed by [`File::sync_all`].
//! - **Corruption tolerance:** [`Wal::read_all`] skips malformed or
//!   truncated trailing lines with a warning; earlier well-formed records
//!   are still returned (§4.1).
//! - **Atomic rewrite:** [`Wal::replace_with_filtered`] writes to a sibling
//!   temp file, syncs it, then renames it over the primary file (§6).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, trace, warn};

use crate::entry::Entry;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying filesystem I/O failure. Per §7 this poisons the WAL:
    /// the caller must stop writes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The operation a [`WalRecord`] replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

/// One line of the WAL: a serialised `PUT` or `DELETE` (§3, §6).
///
/// `timestamp` is authoritative for replay ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub op: Op,
    pub key: String,
    pub value: Option<String>,
    #[serde(rename = "ts")]
    pub timestamp: u64,
}

impl WalRecord {
    /// Builds the record that durably represents a live write.
    pub fn put(key: impl Into<String>, value: impl Into<String>, timestamp: u64) -> Self {
        Self {
            op: Op::Put,
            key: key.into(),
            value: Some(value.into()),
            timestamp,
        }
    }

    /// Builds the record that durably represents a tombstone.
    pub fn delete(key: impl Into<String>, timestamp: u64) -> Self {
        Self {
            op: Op::Delete,
            key: key.into(),
            value: None,
            timestamp,
        }
    }

    /// Converts a replayed record into the [`Entry`] it represents.
    pub fn to_entry(&self) -> Entry {
        match self.op {
            Op::Put => Entry {
                key: self.key.clone(),
                value: self.value.clone(),
                timestamp: self.timestamp,
                is_deleted: false,
            },
            Op::Delete => Entry {
                key: self.key.clone(),
                value: None,
                timestamp: self.timestamp,
                is_deleted: true,
            },
        }
    }
}

/// An append-only, JSON-line write-ahead log.
///
/// See the [module-level documentation](self) for format and concurrency
/// guarantees.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Wal {
    /// Opens (creating if absent) the WAL file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        info!(path = %path.display(), "WAL opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends a single record, durably. The record is serialised as one
    /// JSON line and fsynced before returning (§4.1).
    pub fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let mut line = serde_json::to_string(record)
            .unwrap_or_else(|e| panic!("WalRecord must always serialize: {e}"));
        line.push('\n');

        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        guard.write_all(line.as_bytes())?;
        guard.sync_all()?;
        trace!(key = %record.key, ts = record.timestamp, "WAL record appended");
        Ok(())
    }

    /// Reads every well-formed record currently on disk, in file order.
    ///
    /// A corrupt or truncated trailing line is skipped with a warning;
    /// earlier well-formed records are still returned (§4.1).
    pub fn read_all(&self) -> Result<Vec<WalRecord>, WalError> {
        let guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        read_all_locked(&self.path, &guard)
    }

    /// Truncates the WAL to empty.
    pub fn clear(&self) -> Result<(), WalError> {
        let guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        guard.set_len(0)?;
        guard.sync_all()?;
        info!(path = %self.path.display(), "WAL cleared");
        Ok(())
    }

    /// Reads all records, retains those satisfying `predicate`, and
    /// atomically replaces the WAL with just the retained records.
    ///
    /// This is serialised with [`Wal::append`] under the same lock, so no
    /// record concurrently appended while this runs can be lost or
    /// duplicated (§4.1).
    pub fn replace_with_filtered(
        &self,
        predicate: impl Fn(&WalRecord) -> bool,
    ) -> Result<(), WalError> {
        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let records = read_all_locked(&self.path, &guard)?;
        let kept: Vec<&WalRecord> = records.iter().filter(|r| predicate(r)).collect();

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in &kept {
                let mut line = serde_json::to_string(record)
                    .unwrap_or_else(|e| panic!("WalRecord must always serialize: {e}"));
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Re-open the primary handle so the mutex-protected `File` reflects
        // the renamed inode (the old handle still points at the now-replaced
        // file's old position semantics once reopened fresh).
        *guard = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        info!(
            path = %self.path.display(),
            kept = kept.len(),
            dropped = records.len() - kept.len(),
            "WAL rewritten with filter"
        );
        Ok(())
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads all well-formed lines from `file`, which must already be
/// positioned / owned under the caller's lock.
fn read_all_locked(path: &Path, file: &File) -> Result<Vec<WalRecord>, WalError> {
    let mut handle = file.try_clone()?;
    use std::io::Seek;
    handle.seek(std::io::SeekFrom::Start(0))?;
    let reader = BufReader::new(handle);

    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(path = %path.display(), line = lineno, error = %e, "skipping unreadable WAL line");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = lineno, error = %e, "skipping corrupt WAL line");
            }
        }
    }
    Ok(records)
}
