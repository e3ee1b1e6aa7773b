//! The request layer of one cluster member.
//!
//! A [`Node`] owns one [`ShardHandle`] per shard and answers two kinds of
//! callers:
//!
//! - clients, through [`Node::put`], [`Node::get`] and [`Node::delete`],
//!   which resolve the key's shard on the ring and either run locally or
//!   forward to the replica that can serve them
//! - peers, through [`RequestHandler::handle`], which dispatches each wire
//!   request to the right shard replica
//!
//! Writes retry across `NotLeader` and leaderless windows until
//! `request_timeout`, so a failover shows up to clients as latency rather
//! than an error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::election::{Campaign, ElectionOutcome, ShardRole};
use crate::entry::{Entry, Mutation, NodeId, Sequence, ShardId};
use crate::error::{KvError, Result};
use crate::membership::{MembershipHandle, MembershipView, NodeStatus};
use crate::message::{Envelope, Request, Response, TermTable};
use crate::ring::{Ring, RingHandle};
use crate::routing::{read_target, RoutingHints};
use crate::shard::{ReplicaStatus, ShardHandle, StorageHealth};
use crate::transport::{RequestHandler, Transport};

const RETRY_BACKOFF_START: Duration = Duration::from_millis(20);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(250);

pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) ring: Arc<RingHandle>,
    pub(crate) membership: MembershipHandle,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) hints: Arc<RoutingHints>,
    pub(crate) storage: Arc<StorageHealth>,
    pub(crate) shards: BTreeMap<ShardId, ShardHandle>,
    pub(crate) shutdown: watch::Sender<bool>,
}

/// Point-in-time view of a node, for STATUS and health checks.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: NodeId,
    pub storage_healthy: bool,
    pub ring_nodes: Vec<NodeId>,
    pub peers: Vec<(NodeId, NodeStatus)>,
    /// Shards this node replicates.
    pub shards: Vec<ReplicaStatus>,
}

impl NodeReport {
    pub fn leading(&self) -> usize {
        self.shards.iter().filter(|s| s.role.is_leader()).count()
    }
}

impl fmt::Display for NodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "node {} | storage {} | ring {:?} | leading {}/{} shards",
            self.node,
            if self.storage_healthy { "healthy" } else { "UNHEALTHY" },
            self.ring_nodes,
            self.leading(),
            self.shards.len()
        )?;
        for (peer, status) in &self.peers {
            writeln!(f, "  peer {peer}: {status:?}")?;
        }
        for shard in &self.shards {
            let role = match shard.role {
                ShardRole::NoLeader => "no leader".to_string(),
                ShardRole::Leader { term } => format!("leader (term {term})"),
                ShardRole::Follower { term, leader } => format!("follower of {leader} (term {term})"),
            };
            writeln!(
                f,
                "  shard {:>3}: {role}, applied {}, {} keys, wal {} bytes",
                shard.shard, shard.last_applied, shard.keys, shard.wal_bytes
            )?;
        }
        Ok(())
    }
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ring(&self) -> Arc<Ring> {
        self.ring.snapshot()
    }

    pub fn membership(&self) -> MembershipView {
        self.membership.view()
    }

    pub fn shard_for(&self, key: &str) -> ShardId {
        self.ring.snapshot().resolve(key)
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<Sequence> {
        self.route_write(Mutation::Put {
            key: key.to_string(),
            value: value.into(),
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.route_read(key).await
    }

    /// Deletes `key` by writing a tombstone, whether or not it exists.
    pub async fn delete(&self, key: &str) -> Result<Sequence> {
        self.route_write(Mutation::Delete {
            key: key.to_string(),
        })
        .await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(KvError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sends a write to its shard leader, retrying while leadership settles.
    pub async fn route_write(&self, mutation: Mutation) -> Result<Sequence> {
        let shard = self.shard_for(mutation.key());
        let deadline = Instant::now() + self.config.request_timeout();
        let mut backoff = RETRY_BACKOFF_START;
        let mut target = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = tokio::time::timeout(remaining, self.write_once(shard, mutation.clone(), target))
                .await
                .unwrap_or(Err(KvError::Timeout));
            match attempt {
                Ok(sequence) => return Ok(sequence),
                Err(err) if err.is_retryable() && Instant::now() + backoff < deadline => {
                    target = match &err {
                        KvError::NotLeader { leader, .. } => *leader,
                        _ => None,
                    };
                    debug!(node = self.id, shard, error = %err, ?target, "retrying write");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_once(&self, shard: ShardId, mutation: Mutation, target: Option<NodeId>) -> Result<Sequence> {
        let ring = self.ring.snapshot();
        let destination = self.write_destination(&ring, shard, target)?;
        if destination == self.id {
            return self.local(shard)?.write(mutation).await;
        }
        let response = self
            .call(destination, Request::ClientWrite { shard_id: shard, mutation })
            .await?;
        match response {
            Response::Written { sequence } => Ok(sequence),
            Response::Reject { reason } => Err(reason.into_error(shard, 0)),
            other => Err(KvError::Transport(format!("unexpected reply {other:?}"))),
        }
    }

    /// Shard of `key` and the node a write to it goes to.
    pub fn locate_write(&self, key: &str) -> Result<(ShardId, NodeId)> {
        let ring = self.ring.snapshot();
        let shard = ring.resolve(key);
        Ok((shard, self.write_destination(&ring, shard, None)?))
    }

    /// The known leader, or this node while no leader is known and it holds
    /// a replica.
    fn write_destination(&self, ring: &Ring, shard: ShardId, target: Option<NodeId>) -> Result<NodeId> {
        if !ring.is_available(shard) {
            return Err(KvError::QuorumUnavailable {
                shard,
                alive: ring.replicas(shard).len(),
                quorum: ring.quorum(),
            });
        }
        let leader = target
            .or_else(|| self.hints.leader(shard))
            .filter(|&node| ring.is_replica(shard, node));
        match leader {
            Some(node) => Ok(node),
            None if ring.is_replica(shard, self.id) => Ok(self.id),
            None => Err(KvError::NoLeader(shard)),
        }
    }

    /// Shard of `key` and the replica a read of it goes to first.
    pub fn locate_read(&self, key: &str) -> Result<(ShardId, NodeId)> {
        let ring = self.ring.snapshot();
        let shard = ring.resolve(key);
        let view = self.membership.view();
        read_target(self.id, ring.replicas(shard), self.hints.leader(shard), |n| view.is_alive(n))
            .map(|node| (shard, node))
            .ok_or(KvError::ShardUnavailable(shard))
    }

    /// Reads from the nearest replica. Follower reads may be stale.
    pub async fn route_read(&self, key: &str) -> Result<Vec<u8>> {
        let (shard, first) = self.locate_read(key)?;
        let ring = self.ring.snapshot();
        let view = self.membership.view();
        let fallbacks = ring
            .replicas(shard)
            .iter()
            .copied()
            .filter(|&node| node != first && view.is_alive(node));

        let mut last_error = KvError::ShardUnavailable(shard);
        for node in std::iter::once(first).chain(fallbacks) {
            match self.read_from(node, shard, key).await {
                Err(err @ (KvError::Transport(_) | KvError::Timeout | KvError::Shutdown)) => {
                    debug!(node = self.id, peer = node, shard, error = %err, "read failed; trying next replica");
                    last_error = err;
                }
                result => return result,
            }
        }
        Err(last_error)
    }

    async fn read_from(&self, node: NodeId, shard: ShardId, key: &str) -> Result<Vec<u8>> {
        if node == self.id {
            return self.local(shard)?.read(key).await;
        }
        let request = Request::ClientRead {
            shard_id: shard,
            key: key.to_string(),
        };
        match self.call(node, request).await? {
            Response::Value { value } => Ok(value),
            Response::Reject { reason } => Err(reason.into_error(shard, 0)),
            other => Err(KvError::Transport(format!("unexpected reply {other:?}"))),
        }
    }

    async fn call(&self, to: NodeId, request: Request) -> Result<Response> {
        let envelope = Envelope { from: self.id, request };
        self.transport.call(to, envelope).await
    }

    fn local(&self, shard: ShardId) -> Result<&ShardHandle> {
        self.shards.get(&shard).ok_or(KvError::ShardUnavailable(shard))
    }

    pub async fn shard_status(&self, shard: ShardId) -> Result<ReplicaStatus> {
        self.local(shard)?.status().await
    }

    /// Local replica contents of `shard`, in key order.
    pub async fn shard_snapshot(&self, shard: ShardId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.local(shard)?.snapshot().await
    }

    pub async fn status(&self) -> Result<NodeReport> {
        let ring = self.ring.snapshot();
        let mut shards = Vec::new();
        for shard in ring.shards_of(self.id) {
            shards.push(self.local(shard)?.status().await?);
        }
        let view = self.membership.view();
        Ok(NodeReport {
            node: self.id,
            storage_healthy: self.storage.is_healthy(),
            ring_nodes: ring.nodes().collect(),
            peers: view.peers.values().map(|p| (p.node_id, p.status)).collect(),
            shards,
        })
    }

    pub fn storage_healthy(&self) -> bool {
        self.storage.is_healthy()
    }

    /// Lets writes through again after an operator fixed the storage fault.
    /// Each replica re-validates its WAL before its next append.
    pub fn mark_storage_healthy(&self) {
        info!(node = self.id, "storage marked healthy");
        self.storage.mark_healthy();
    }

    /// Stops every background task and shard replica of this node.
    pub fn shutdown(&self) {
        info!(node = self.id, "shutting down");
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Merges a peer's term table and tells affected replicas.
    pub(crate) async fn absorb_terms(&self, table: &TermTable) {
        for (shard, entry) in self.hints.merge(table) {
            if let Some(handle) = self.shards.get(&shard) {
                handle.observe_term(entry.term, entry.leader).await;
            }
        }
    }

    /// Runs an election round for every shard this node replicates but
    /// does not lead.
    pub async fn run_elections(&self) {
        let ring = self.ring.snapshot();
        let view = self.membership.view();
        let rounds = ring
            .shards_of(self.id)
            .into_iter()
            .filter_map(|shard| self.shards.get(&shard))
            .map(|handle| self.elect(handle, &ring, &view));
        join_all(rounds).await;
    }

    async fn elect(&self, handle: &ShardHandle, ring: &Ring, view: &MembershipView) {
        let shard = handle.shard();
        match handle.status().await {
            Ok(status) => match status.role {
                ShardRole::Leader { .. } => return,
                ShardRole::Follower { leader, .. } if view.is_alive(leader) => return,
                _ => {}
            },
            Err(_) => return,
        }
        let campaign = Campaign {
            local: self.id,
            shard,
            candidates: ring.leader_candidates(shard, |n| view.is_alive(n)),
            quorum: ring.quorum(),
            replica: handle,
            transport: &self.transport,
            rpc_timeout: self.config.rpc_timeout(),
        };
        match campaign.run().await {
            Ok(ElectionOutcome::Elected { term }) => {
                debug!(node = self.id, shard, term, "election won");
            }
            Ok(ElectionOutcome::NoQuorum { responders, quorum }) => {
                debug!(node = self.id, shard, responders, quorum, "election lacks quorum");
            }
            Ok(outcome) => debug!(node = self.id, shard, ?outcome, "election round finished"),
            Err(err) => warn!(node = self.id, shard, error = %err, "election round failed"),
        }
    }

    async fn dispatch(&self, from: NodeId, request: Request) -> Result<Response> {
        match request {
            Request::Heartbeat { from_node, term_table } => {
                debug!(node = self.id, peer = from_node, "heartbeat");
                self.absorb_terms(&term_table).await;
                Ok(Response::HeartbeatAck {
                    from_node: self.id,
                    term_table: self.hints.snapshot(),
                })
            }
            Request::LeadershipClaim {
                shard_id,
                term,
                candidate_id,
                last_sequence,
                last_term,
            } => {
                self.local(shard_id)?
                    .claim(candidate_id, term, last_sequence, last_term)
                    .await
            }
            Request::ReplicateEntry {
                shard_id,
                term,
                sequence,
                prev_term,
                key,
                value,
                tombstone,
            } => {
                let entry = Entry {
                    key,
                    value,
                    sequence,
                    term,
                    tombstone,
                };
                self.local(shard_id)?
                    .replicate(from, term, prev_term, entry)
                    .await
            }
            Request::CatchUpRequest {
                shard_id,
                from_sequence,
            } => self.local(shard_id)?.serve_catch_up(from_sequence).await,
            Request::ShardStatusRequest { shard_id } => {
                let status = self.local(shard_id)?.status().await?;
                Ok(Response::ShardStatus {
                    term: status.term,
                    last_sequence: status.last_sequence,
                    last_term: status.last_term,
                    role: status.role.kind(),
                })
            }
            Request::ClientWrite { shard_id, mutation } => {
                let sequence = self.local(shard_id)?.write(mutation).await?;
                Ok(Response::Written { sequence })
            }
            Request::ClientRead { shard_id, key } => {
                let value = self.local(shard_id)?.read(key).await?;
                Ok(Response::Value { value })
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn handle(&self, envelope: Envelope) -> Response {
        let kind = envelope.request.kind();
        match self.dispatch(envelope.from, envelope.request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(node = self.id, peer = envelope.from, request = kind, error = %err, "request rejected");
                Response::reject(&err)
            }
        }
    }
}
