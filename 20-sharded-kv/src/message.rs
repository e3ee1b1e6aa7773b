//! Inter-node wire contract and its framing.
//!
//! Every call is one [`Envelope`] answered by one [`Response`]. Frames are
//! length-prefixed:
//!
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: bincode-encoded payload
//!
//! This lets a reader take exactly the bytes it needs without scanning for
//! delimiters.

use std::collections::BTreeMap;
use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::entry::{Entry, Mutation, NodeId, Sequence, ShardId, Term, MAX_ENTRY_LEN};
use crate::error::KvError;

/// Room for one maximal entry plus envelope overhead, or a catch-up batch.
const MAX_FRAME_LEN: usize = 4 * MAX_ENTRY_LEN;

/// What a node knows about one shard's leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    pub term: Term,
    pub leader: Option<NodeId>,
}

/// Per-shard term knowledge exchanged on every heartbeat.
pub type TermTable = BTreeMap<ShardId, TermEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    NoLeader,
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Heartbeat {
        from_node: NodeId,
        term_table: TermTable,
    },
    LeadershipClaim {
        shard_id: ShardId,
        term: Term,
        candidate_id: NodeId,
        last_sequence: Sequence,
        last_term: Term,
    },
    /// One entry written by the leader in `term`. `prev_term` is the term of
    /// the leader's entry at `sequence - 1`, if the leader still holds it.
    ReplicateEntry {
        shard_id: ShardId,
        term: Term,
        sequence: Sequence,
        prev_term: Option<Term>,
        key: String,
        value: Vec<u8>,
        tombstone: bool,
    },
    CatchUpRequest {
        shard_id: ShardId,
        from_sequence: Sequence,
    },
    ShardStatusRequest {
        shard_id: ShardId,
    },
    /// A client write forwarded to the shard leader.
    ClientWrite {
        shard_id: ShardId,
        mutation: Mutation,
    },
    /// A client read forwarded to a replica.
    ClientRead {
        shard_id: ShardId,
        key: String,
    },
}

impl Request {
    pub fn replicate(shard_id: ShardId, term: Term, prev_term: Option<Term>, entry: &Entry) -> Self {
        Request::ReplicateEntry {
            shard_id,
            term,
            sequence: entry.sequence,
            prev_term,
            key: entry.key.clone(),
            value: entry.value.clone(),
            tombstone: entry.tombstone,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Heartbeat { .. } => "heartbeat",
            Request::LeadershipClaim { .. } => "leadership_claim",
            Request::ReplicateEntry { .. } => "replicate_entry",
            Request::CatchUpRequest { .. } => "catch_up",
            Request::ShardStatusRequest { .. } => "shard_status",
            Request::ClientWrite { .. } => "client_write",
            Request::ClientRead { .. } => "client_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    HeartbeatAck {
        from_node: NodeId,
        term_table: TermTable,
    },
    Accept,
    Ack,
    Reject {
        reason: RejectReason,
    },
    /// One batch of the requested log suffix, in sequence order.
    CatchUp {
        entries: Vec<Entry>,
        leader_last_sequence: Sequence,
    },
    ShardStatus {
        term: Term,
        last_sequence: Sequence,
        last_term: Term,
        role: RoleKind,
    },
    Written {
        sequence: Sequence,
    },
    Value {
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    StaleTerm { current: Term },
    /// The claimant's log is less complete than the receiver's.
    LogBehind { last_sequence: Sequence },
    /// The receiver's log disagreed with the leader's before `sequence` and
    /// was cut back; it will catch up instead.
    Diverged { sequence: Sequence },
    EntryTooLarge { size: usize, limit: usize },
    NotLeader { leader: Option<NodeId> },
    NoLeader,
    QuorumUnavailable { alive: usize, quorum: usize },
    ShardUnavailable,
    StorageUnhealthy,
    NotFound,
    Timeout,
    Other(String),
}

impl From<&KvError> for RejectReason {
    fn from(err: &KvError) -> Self {
        match err {
            KvError::StaleTerm { current, .. } => RejectReason::StaleTerm { current: *current },
            KvError::NotLeader { leader, .. } => RejectReason::NotLeader { leader: *leader },
            KvError::NoLeader(_) => RejectReason::NoLeader,
            KvError::QuorumUnavailable { alive, quorum, .. } => RejectReason::QuorumUnavailable {
                alive: *alive,
                quorum: *quorum,
            },
            KvError::ShardUnavailable(_) => RejectReason::ShardUnavailable,
            KvError::StorageUnhealthy | KvError::Io(_) => RejectReason::StorageUnhealthy,
            KvError::NotFound => RejectReason::NotFound,
            KvError::Timeout => RejectReason::Timeout,
            KvError::EntryTooLarge { size, limit } => RejectReason::EntryTooLarge {
                size: *size,
                limit: *limit,
            },
            other => RejectReason::Other(other.to_string()),
        }
    }
}

impl RejectReason {
    /// Rebuilds the error a remote node reported for `shard`.
    pub fn into_error(self, shard: ShardId, received: Term) -> KvError {
        match self {
            RejectReason::StaleTerm { current } => KvError::StaleTerm { received, current },
            RejectReason::NotLeader { leader } => KvError::NotLeader { shard, leader },
            RejectReason::NoLeader => KvError::NoLeader(shard),
            RejectReason::QuorumUnavailable { alive, quorum } => KvError::QuorumUnavailable {
                shard,
                alive,
                quorum,
            },
            RejectReason::ShardUnavailable => KvError::ShardUnavailable(shard),
            RejectReason::StorageUnhealthy => KvError::StorageUnhealthy,
            RejectReason::NotFound => KvError::NotFound,
            RejectReason::Timeout => KvError::Timeout,
            RejectReason::EntryTooLarge { size, limit } => KvError::EntryTooLarge { size, limit },
            RejectReason::Diverged { sequence } => {
                KvError::Transport(format!("replica log diverged before sequence {sequence}"))
            }
            RejectReason::LogBehind { last_sequence } => {
                KvError::Transport(format!("candidate log is behind sequence {last_sequence}"))
            }
            RejectReason::Other(msg) => KvError::Transport(msg),
        }
    }
}

impl Response {
    pub fn reject(err: &KvError) -> Self {
        Response::Reject { reason: err.into() }
    }
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map(|(message, _)| Some(message))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
