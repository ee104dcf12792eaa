//! The [`Entry`] type: the atomic unit carried through every layer of the
//! store (§3). Memtables, runs, and the WAL all speak this one type so that
//! merging — in a memtable read, a run scan, or a compaction — never needs
//! a translation step.

use serde::{Deserialize, Serialize};

/// A single key's state at one point in logical time.
///
/// Equality is defined by `key` alone (see [`Entry::eq`]); ordering is
/// lexicographic by `key` (see [`Entry::cmp`]). For any key, the `Entry`
/// with the largest `timestamp` wins across every memory and disk layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Non-empty UTF-8 string, at most 1 KiB.
    pub key: String,
    /// UTF-8 string at most 1 MiB, or absent for a tombstone.
    pub value: Option<String>,
    /// 64-bit monotonic microsecond counter; authoritative for conflict resolution.
    pub timestamp: u64,
    /// `true` marks this entry as a tombstone. Implies `value.is_none()`.
    pub is_deleted: bool,
}

impl Entry {
    /// Builds a live (non-tombstone) entry.
    pub fn put(key: impl Into<String>, value: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp,
            is_deleted: false,
        }
    }

    /// Builds a tombstone entry.
    pub fn tombstone(key: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp,
            is_deleted: true,
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_key_only() {
        let a = Entry::put("k", "v1", 1);
        let b = Entry::put("k", "v2", 2);
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_is_lexicographic_by_key() {
        let a = Entry::put("a", "x", 100);
        let b = Entry::put("b", "x", 1);
        assert!(a < b);
    }

    #[test]
    fn tombstone_has_no_value() {
        let t = Entry::tombstone("k", 5);
        assert!(t.is_deleted);
        assert!(t.value.is_none());
    }
}
