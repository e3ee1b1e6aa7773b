//! In-memory key-value state for one shard replica.
//!
//! The store is only ever mutated by applying entries that are already in the
//! replica's WAL, so a restart rebuilds it exactly by replaying the log.
//!
//! # Why BTreeMap instead of HashMap?
//!
//! Deterministic iteration keeps STATUS output and test assertions stable.
//! The performance difference is negligible at the sizes a shard holds.

use std::collections::BTreeMap;

use crate::entry::{Entry, Sequence};
use crate::error::{KvError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Versioned {
    value: Vec<u8>,
    sequence: Sequence,
}

#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, Versioned>,
    last_applied: Sequence,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from replayed WAL entries.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.apply(entry);
        }
        store
    }

    /// Applies a logged entry. Returns `false` when the entry's sequence was
    /// already applied, which leaves the store untouched.
    ///
    /// Callers apply entries in sequence order; a sequence above
    /// `last_applied + 1` is only legal where the log was compacted.
    pub fn apply(&mut self, entry: &Entry) -> bool {
        if entry.sequence <= self.last_applied {
            return false;
        }
        if entry.tombstone {
            self.data.remove(&entry.key);
        } else {
            self.data.insert(
                entry.key.clone(),
                Versioned {
                    value: entry.value.clone(),
                    sequence: entry.sequence,
                },
            );
        }
        self.last_applied = entry.sequence;
        true
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .get(key)
            .map(|v| v.value.clone())
            .ok_or(KvError::NotFound)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Sequence of the write that produced the current value of `key`.
    pub fn version(&self, key: &str) -> Option<Sequence> {
        self.data.get(key).map(|v| v.sequence)
    }

    pub fn last_applied(&self) -> Sequence {
        self.last_applied
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clones the live key-value pairs in key order.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data
            .iter()
            .map(|(key, v)| (key.clone(), v.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_by_sequence() {
        let mut store = KvStore::new();
        store.apply(&Entry::put(1, "a", "1"));
        store.apply(&Entry::put(2, "a", "2"));
        store.apply(&Entry::delete(3, "a"));
        store.apply(&Entry::put(4, "a", "4"));
        assert_eq!(store.get("a").unwrap(), b"4".to_vec());
        assert_eq!(store.version("a"), Some(4));
        assert_eq!(store.last_applied(), 4);
    }

    #[test]
    fn tombstone_hides_key() {
        let mut store = KvStore::new();
        store.apply(&Entry::put(1, "a", "1"));
        store.apply(&Entry::delete(2, "a"));
        assert!(matches!(store.get("a"), Err(KvError::NotFound)));
        assert!(!store.contains("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn reapplying_a_sequence_is_a_no_op() {
        let mut store = KvStore::new();
        let first = Entry::put(1, "a", "1");
        assert!(store.apply(&first));
        store.apply(&Entry::put(2, "b", "2"));
        let before = store.snapshot();

        assert!(!store.apply(&first));
        assert!(!store.apply(&Entry::put(2, "b", "other")));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.last_applied(), 2);
    }

    #[test]
    fn rebuild_from_entries_matches_incremental_apply() {
        let entries = vec![
            Entry::put(1, "x", "1"),
            Entry::put(2, "y", "2"),
            Entry::delete(3, "x"),
            Entry::put(4, "z", "3"),
        ];
        let mut incremental = KvStore::new();
        for entry in &entries {
            incremental.apply(entry);
        }
        let rebuilt = KvStore::from_entries(&entries);
        assert_eq!(rebuilt.snapshot(), incremental.snapshot());
        assert_eq!(rebuilt.len(), 2);
    }
}
