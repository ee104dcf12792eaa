//! `lsmkv`: an embeddable, persistent, ordered key-value store built on an
//! LSM-tree architecture.
//!
//! ```text
//!                   put/get/delete
//!                         |
//!                      Store (facade)
//!                 /       |         \
//!               WAL   Memtable    Compactor
//!            (durability) Manager  (leveled merge)
//!                         |             |
//!                    immutable      Run (SSTable)
//!                    memtables      per level, newest
//!                     (queue)       L0 run wins ties
//!                         \             /
//!                          flush -> new L0 run
//!                                       |
//!                                  bloom filter
//!                                  sparse index
//!                                  mmap'd data file
//! ```
//!
//! Every write lands in the write-ahead log before the memtable, so a crash
//! before the next flush loses nothing. Once the active memtable fills, it
//! rotates into an immutable queue and a background worker pool flushes it
//! to a new level-0 run; a background leveled compactor keeps each level's
//! size bounded by periodically merging it into the next.
//!
//! # Example
//!
//! ```no_run
//! use lsmkv::{Store, StoreConfig};
//!
//! # fn main() -> Result<(), lsmkv::StoreError> {
//! let store = Store::open("/tmp/example-db", StoreConfig::default())?;
//! store.put("user:1", "alice")?;
//! assert_eq!(store.get("user:1")?, Some("alice".to_string()));
//! store.delete("user:1")?;
//! assert_eq!(store.get("user:1")?, None);
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Non-goals
//!
//! No range scans or iteration, no transactions or MVCC, no cross-process
//! concurrency, no data-page checksums, no secondary indexes, TTL, or
//! compression. A single process opening a given directory is expected to
//! own it exclusively.

pub mod bloom;
pub mod compaction;
pub mod config;
pub mod entry;
pub mod error;
pub mod manifest;
pub mod memtable;
pub mod sparse_index;
pub mod sstable;
pub mod store;
pub mod wal;

pub use config::StoreConfig;
pub use entry::Entry;
pub use error::{StoreError, StoreResult};
pub use store::{LevelInfo, Stats, Store};
