use crate::entry::{NodeId, ShardId, Term};

/// Errors surfaced by the storage and coordination layers.
///
/// Network and timeout failures on heartbeats and replication are absorbed by
/// the membership and term state machines; only quorum, routing, and
/// validation failures reach callers of [`crate::node::Node`].
#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("shard {shard} has {alive} reachable replicas, quorum is {quorum}")]
    QuorumUnavailable {
        shard: ShardId,
        alive: usize,
        quorum: usize,
    },
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { received: Term, current: Term },
    #[error("partial WAL write at byte {offset}; {discarded} trailing bytes discarded")]
    PartialWriteDetected { offset: u64, discarded: u64 },
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node is not the leader of shard {shard}; hint: {leader:?}")]
    NotLeader {
        shard: ShardId,
        leader: Option<NodeId>,
    },
    #[error("shard {0} has no leader")]
    NoLeader(ShardId),
    #[error("shard {0} is unavailable: replica set is below quorum")]
    ShardUnavailable(ShardId),
    #[error("operation timed out")]
    Timeout,
    #[error("storage is unhealthy; writes are refused")]
    StorageUnhealthy,
    #[error("entry of {size} bytes exceeds the {limit} byte limit")]
    EntryTooLarge { size: usize, limit: usize },
    #[error("codec error: {0}")]
    Codec(#[from] bincode::error::EncodeError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("node is shutting down")]
    Shutdown,
}

impl KvError {
    /// Whether a write may succeed if retried after routing state settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::NotLeader { .. }
                | KvError::NoLeader(_)
                | KvError::StaleTerm { .. }
                | KvError::Timeout
                | KvError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
