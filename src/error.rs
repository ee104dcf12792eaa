//! Crate-wide error hierarchy.
//!
//! Every module keeps a narrow, module-local error type (`WalError`,
//! `SstableError`, `ManifestError`, ...) close to the code that produces it,
//! the same way the storage layers of this crate keep their own `thiserror`
//! enums. `StoreError` is the single type that crosses the public API
//! boundary; each narrower error converts into it via `#[from]`.

use std::io;
use thiserror::Error;

use crate::compaction::CompactionError;
use crate::manifest::ManifestError;
use crate::memtable::ManagerError;
use crate::sstable::SstableError;
use crate::wal::WalError;

/// Errors returned by the public [`crate::store::Store`] API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A key or value violated a size or emptiness constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was attempted after [`crate::store::Store::close`].
    #[error("store is closed")]
    Closed,

    /// The write-ahead log failed to append or sync a record. Per the
    /// error taxonomy this poisons the store for further writes.
    #[error("WAL I/O error: {0}")]
    WalIo(#[from] WalError),

    /// A run (SSTable) failed to read or write.
    #[error("run I/O error: {0}")]
    RunIo(#[from] SstableError),

    /// A manifest failed to read, write, or atomically rewrite.
    #[error("manifest I/O error: {0}")]
    ManifestIo(#[from] ManifestError),

    /// A background or manual compaction failed.
    #[error("compaction I/O error: {0}")]
    CompactionIo(#[from] CompactionError),

    /// The memtable manager failed to rotate or flush.
    #[error("memtable error: {0}")]
    Memtable(#[from] ManagerError),

    /// Plain filesystem I/O failure not otherwise classified.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `flush()` was called with nothing to flush.
    #[error("nothing to flush: active memtable is empty")]
    NothingToFlush,

    /// `compact()` was called with no runs on disk.
    #[error("nothing to compact: store has no runs")]
    NothingToCompact,
}

/// Convenience alias used throughout the public API.
pub type StoreResult<T> = Result<T, StoreError>;
