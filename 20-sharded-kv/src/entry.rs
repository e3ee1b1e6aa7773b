//! Identifiers and the replicated log entry.

use serde::{Deserialize, Serialize};

/// Numeric node identifier. Lower ids win election ties.
pub type NodeId = u64;

/// Index of a shard, `0..shard_count`.
pub type ShardId = u32;

/// Per-shard write sequence number. The first entry of a shard is 1.
pub type Sequence = u64;

/// Per-shard election epoch.
pub type Term = u64;

/// Largest encoded entry a WAL record or a single replication frame carries.
pub const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// A single mutation of one key.
///
/// Entries are immutable once appended to a WAL. A later entry for the same
/// key with a higher sequence supersedes an earlier one; a delete is just an
/// entry with `tombstone` set and an empty value.
///
/// `term` is the leader term the entry was written in. Two logs holding the
/// same sequence with different terms have diverged at that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub sequence: Sequence,
    pub term: Term,
    pub tombstone: bool,
}

impl Entry {
    pub fn put(sequence: Sequence, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            sequence,
            term: 0,
            tombstone: false,
        }
    }

    pub fn delete(sequence: Sequence, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            sequence,
            term: 0,
            tombstone: true,
        }
    }

    pub fn in_term(mut self, term: Term) -> Self {
        self.term = term;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(entry, _)| entry)
    }
}

/// A write that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }

    /// Stamps the mutation with its shard sequence number and the term of
    /// the leader that assigned it.
    pub fn into_entry(self, sequence: Sequence, term: Term) -> Entry {
        let entry = match self {
            Mutation::Put { key, value } => Entry::put(sequence, key, value),
            Mutation::Delete { key } => Entry::delete(sequence, key),
        };
        entry.in_term(term)
    }
}
