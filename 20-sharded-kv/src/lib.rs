//! Sharded, replicated in-memory key-value store.
//!
//! Keys hash onto a consistent-hash ring that is cut into a fixed number of
//! shards. Every shard is replicated to the first N distinct nodes clockwise
//! from its range, one of which is elected the shard's leader. The leader
//! sequences every write, logs it to its write-ahead log and only
//! acknowledges it once a quorum of replicas has logged and applied it too.
//!
//! # Architecture
//!
//! Each node runs a handful of tokio tasks:
//!
//! - **Shard replicas**: one actor per shard owning its WAL, store, role and
//!   term; everything else talks to it over a channel
//! - **Membership monitor**: heartbeats every peer and walks each through
//!   ALIVE, SUSPECT and DEAD
//! - **Background ticks**: elections for leaderless shards, follower
//!   catch-up, WAL compaction, and ring rewiring on membership changes
//! - **Peer listener**: answers requests from other nodes
//!
//! Nodes talk through the [`transport::Transport`] trait, so the same node
//! runs over TCP or over an in-process network with injected faults.
//!
//! # Why this design?
//!
//! - **Actor per shard**: shard state is never shared, so there are no locks
//!   around the WAL or store and writes are trivially serialized
//! - **Terms per shard**: a failover only touches the shards the failed node
//!   led, and stale leaders are fenced by term checks on every message
//! - **Heartbeat gossip**: term tables ride on heartbeats, so routing hints
//!   converge without a separate discovery protocol
//!
//! # Modules
//!
//! - [`node`]: Client API, request routing, peer request dispatch
//! - [`runtime`]: Node startup and background tasks
//! - [`shard`]: Per-shard replica actor (write path, follower path, catch-up)
//! - [`election`]: Per-shard leader election
//! - [`replication`]: Quorum collection for replication and claims
//! - [`membership`]: Heartbeats and failure detection
//! - [`ring`]: Consistent-hash ring with virtual nodes
//! - [`routing`]: Leader hints gossiped between nodes
//! - [`wal`]: Checksummed write-ahead log
//! - [`store`]: In-memory store rebuilt from the WAL
//! - [`message`]: Wire messages and framing
//! - [`transport`]: TCP and in-process transports
//! - [`config`]: Node configuration
//! - [`console`]: REPL command parsing

pub mod config;
pub mod console;
pub mod election;
pub mod entry;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod replication;
pub mod ring;
pub mod routing;
pub mod runtime;
pub mod shard;
pub mod store;
pub mod transport;
pub mod wal;

pub use config::Config;
pub use entry::{Entry, Mutation, NodeId, Sequence, ShardId, Term};
pub use error::{KvError, Result};
pub use node::Node;
