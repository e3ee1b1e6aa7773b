//! Per-shard replica actor.
//!
//! Each shard replica on a node is a task that exclusively owns the shard's
//! WAL, its [`KvStore`], its role and its term. Everything else talks to it
//! through a [`ShardHandle`], which sends a command carrying a oneshot
//! `respond_to` channel, so no lock ever guards replica state.
//!
//! # Write path on the leader
//!
//! Writes are processed one at a time: the leader assigns the next
//! sequence, appends to its own WAL, then hands the fan-out to a separate
//! task. While that replication round is in flight the actor keeps serving
//! its inbox (claims, catch-up requests, status), and further writes queue
//! behind it. When the round reports back, the entry is applied and
//! acknowledged, or rolled back from the WAL if quorum was not reached or
//! leadership was lost meanwhile. An entry that was logged but never applied
//! is never served: it is dropped before the next append and before this
//! replica takes leadership.
//!
//! # Follower path
//!
//! A follower appends and applies every entry in sequence order before
//! acknowledging. Entries that arrive early wait in an out-of-order buffer
//! while a catch-up request fetches what is missing from the leader, instead
//! of waiting for the anti-entropy tick.
//!
//! Every entry carries the term it was written in. When the leader sends a
//! sequence this replica already holds under a different term, or its
//! predecessor's term disagrees, the replica cuts its log back to the last
//! agreeing entry, rebuilds its store from what remains and takes the
//! leader's version instead.

use std::collections::{BTreeMap, VecDeque};
use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::election::ShardRole;
use crate::entry::{Entry, Mutation, NodeId, Sequence, ShardId, Term, MAX_ENTRY_LEN};
use crate::error::{KvError, Result};
use crate::membership::MembershipHandle;
use crate::message::{Envelope, RejectReason, Request, Response, TermEntry};
use crate::replication::{collect_quorum, CommitResult, FollowerReply};
use crate::ring::RingHandle;
use crate::routing::RoutingHints;
use crate::store::KvStore;
use crate::transport::Transport;
use crate::wal::Wal;

const INBOX_CAPACITY: usize = 256;
/// Payload bytes per catch-up response; a batch always holds at least one entry.
const CATCH_UP_BYTES: usize = 2 * MAX_ENTRY_LEN;

/// Node-wide durable storage health. One failed append anywhere on the
/// node stops every replica on it from accepting writes.
#[derive(Debug)]
pub struct StorageHealth {
    healthy: AtomicBool,
}

impl Default for StorageHealth {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }
}

impl StorageHealth {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }
}

/// Everything a replica shares with the rest of its node.
pub struct ReplicaContext {
    pub local: NodeId,
    pub config: Arc<Config>,
    pub ring: Arc<RingHandle>,
    pub membership: MembershipHandle,
    pub transport: Arc<dyn Transport>,
    pub hints: Arc<RoutingHints>,
    pub storage: Arc<StorageHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub shard: ShardId,
    pub role: ShardRole,
    pub term: Term,
    /// Last sequence in the WAL, including an entry still being replicated.
    pub last_sequence: Sequence,
    /// Term of the entry at `last_sequence`.
    pub last_term: Term,
    pub last_applied: Sequence,
    pub keys: usize,
    pub wal_bytes: u64,
}

enum Command {
    Write {
        mutation: Mutation,
        respond_to: oneshot::Sender<Result<Sequence>>,
    },
    Read {
        key: String,
        respond_to: oneshot::Sender<Result<Vec<u8>>>,
    },
    Replicate {
        leader: NodeId,
        term: Term,
        prev_term: Option<Term>,
        entry: Entry,
        respond_to: oneshot::Sender<Response>,
    },
    Claim {
        candidate: NodeId,
        term: Term,
        last_sequence: Sequence,
        last_term: Term,
        respond_to: oneshot::Sender<Response>,
    },
    BeginCampaign {
        term: Term,
        respond_to: oneshot::Sender<Result<()>>,
    },
    BecomeLeader {
        term: Term,
        respond_to: oneshot::Sender<bool>,
    },
    Status {
        respond_to: oneshot::Sender<ReplicaStatus>,
    },
    ServeCatchUp {
        from: Sequence,
        respond_to: oneshot::Sender<Response>,
    },
    Snapshot {
        respond_to: oneshot::Sender<BTreeMap<String, Vec<u8>>>,
    },
    ObserveTerm {
        term: Term,
        leader: Option<NodeId>,
    },
    RingChanged,
    SyncTick,
    Compact,
}

/// Cloneable address of one shard replica.
#[derive(Clone)]
pub struct ShardHandle {
    shard: ShardId,
    commands: mpsc::Sender<Command>,
}

impl ShardHandle {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| KvError::Shutdown)?;
        rx.await.map_err(|_| KvError::Shutdown)
    }

    async fn notify(&self, command: Command) {
        // A stopped replica has nothing left to notify.
        let _ = self.commands.send(command).await;
    }

    /// Sequences and replicates a mutation. Only succeeds on the leader.
    pub async fn write(&self, mutation: Mutation) -> Result<Sequence> {
        self.request(|respond_to| Command::Write { mutation, respond_to })
            .await?
    }

    /// Reads this replica's applied state, which may lag the leader.
    pub async fn read(&self, key: impl Into<String>) -> Result<Vec<u8>> {
        let key = key.into();
        self.request(|respond_to| Command::Read { key, respond_to })
            .await?
    }

    /// Offers an entry `leader` wrote in `term`. `prev_term` is the term the
    /// leader holds at the preceding sequence, if it still has it.
    pub async fn replicate(
        &self,
        leader: NodeId,
        term: Term,
        prev_term: Option<Term>,
        entry: Entry,
    ) -> Result<Response> {
        self.request(|respond_to| Command::Replicate {
            leader,
            term,
            prev_term,
            entry,
            respond_to,
        })
        .await
    }

    pub async fn claim(
        &self,
        candidate: NodeId,
        term: Term,
        last_sequence: Sequence,
        last_term: Term,
    ) -> Result<Response> {
        self.request(|respond_to| Command::Claim {
            candidate,
            term,
            last_sequence,
            last_term,
            respond_to,
        })
        .await
    }

    /// Grants this node's own claim for `term` before it asks anyone else.
    pub async fn begin_campaign(&self, term: Term) -> Result<()> {
        self.request(|respond_to| Command::BeginCampaign { term, respond_to })
            .await?
    }

    /// Takes leadership for `term` if nothing newer happened since the
    /// campaign started.
    pub async fn become_leader(&self, term: Term) -> Result<bool> {
        self.request(|respond_to| Command::BecomeLeader { term, respond_to })
            .await
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        self.request(|respond_to| Command::Status { respond_to }).await
    }

    pub async fn serve_catch_up(&self, from: Sequence) -> Result<Response> {
        self.request(|respond_to| Command::ServeCatchUp { from, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        self.request(|respond_to| Command::Snapshot { respond_to }).await
    }

    pub async fn observe_term(&self, term: Term, leader: Option<NodeId>) {
        self.notify(Command::ObserveTerm { term, leader }).await
    }

    pub async fn ring_changed(&self) {
        self.notify(Command::RingChanged).await
    }

    /// Asks the leader for anything this replica is missing.
    pub async fn sync(&self) {
        self.notify(Command::SyncTick).await
    }

    pub async fn compact(&self) {
        self.notify(Command::Compact).await
    }
}

/// Durable election state of one replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TermRecord {
    /// Highest term observed.
    term: Term,
    /// Highest term whose claim this replica accepted or made itself.
    granted: Term,
}

async fn load_terms(path: &Path) -> Result<TermRecord> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            KvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TermRecord::default()),
        Err(err) => Err(err.into()),
    }
}

/// Replaces the term record atomically. The record, the rename and the
/// directory entry are all synced before this returns.
async fn store_terms(path: &Path, record: TermRecord) -> Result<()> {
    let bytes = serde_json::to_vec(&record)
        .map_err(|err| KvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
    let tmp = path.with_extension("term.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    if let Some(dir) = path.parent() {
        tokio::fs::File::open(dir).await?.sync_all().await?;
    }
    Ok(())
}

/// Opens the shard's WAL, rebuilds its store and starts the replica task.
pub async fn spawn_replica(
    ctx: Arc<ReplicaContext>,
    shard: ShardId,
    shutdown: watch::Receiver<bool>,
) -> Result<ShardHandle> {
    let dir = ctx.config.node_dir();
    let (wal, replay) = Wal::open(dir.join(format!("shard-{shard}.wal"))).await?;
    let store = KvStore::from_entries(&replay.entries);
    let terms_path = dir.join(format!("shard-{shard}.term"));
    let terms = load_terms(&terms_path).await?;

    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let replica = ShardReplica {
        ctx,
        shard,
        wal,
        store,
        terms,
        terms_path,
        role: ShardRole::NoLeader,
        inbox: rx,
        shutdown,
        queued: VecDeque::new(),
        in_flight: None,
        out_of_order: BTreeMap::new(),
        catch_up: None,
    };
    replica.publish();
    tokio::spawn(replica.run());
    Ok(ShardHandle {
        shard,
        commands: tx,
    })
}

struct QueuedWrite {
    mutation: Mutation,
    respond_to: oneshot::Sender<Result<Sequence>>,
}

/// The one write whose replication round is running.
struct InFlight {
    entry: Entry,
    term: Term,
    respond_to: oneshot::Sender<Result<Sequence>>,
    outcome: oneshot::Receiver<CommitResult>,
}

struct CatchUpBatch {
    entries: Vec<Entry>,
    leader_last: Sequence,
}

struct Buffered {
    entry: Entry,
    waiters: Vec<oneshot::Sender<Response>>,
}

enum Event {
    Command(Command),
    Replicated(Option<CommitResult>),
    CaughtUp(Option<CatchUpBatch>),
    Shutdown,
}

struct ShardReplica {
    ctx: Arc<ReplicaContext>,
    shard: ShardId,
    wal: Wal,
    store: KvStore,
    terms: TermRecord,
    terms_path: PathBuf,
    role: ShardRole,
    inbox: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    queued: VecDeque<QueuedWrite>,
    in_flight: Option<InFlight>,
    out_of_order: BTreeMap<Sequence, Buffered>,
    catch_up: Option<oneshot::Receiver<Option<CatchUpBatch>>>,
}

async fn replication_outcome(in_flight: &mut Option<InFlight>) -> Option<CommitResult> {
    match in_flight {
        Some(flight) => (&mut flight.outcome).await.ok(),
        None => pending().await,
    }
}

async fn catch_up_batch(catch_up: &mut Option<oneshot::Receiver<Option<CatchUpBatch>>>) -> Option<CatchUpBatch> {
    match catch_up {
        Some(rx) => rx.await.ok().flatten(),
        None => pending().await,
    }
}

impl ShardReplica {
    async fn run(mut self) {
        info!(
            node = self.ctx.local,
            shard = self.shard,
            term = self.terms.term,
            last_sequence = self.wal.last_sequence(),
            keys = self.store.len(),
            "shard replica started"
        );
        loop {
            let event = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Shutdown,
                },
                outcome = replication_outcome(&mut self.in_flight) => Event::Replicated(outcome),
                batch = catch_up_batch(&mut self.catch_up) => Event::CaughtUp(batch),
                _ = self.shutdown.changed() => Event::Shutdown,
            };
            match event {
                Event::Command(command) => self.handle(command).await,
                Event::Replicated(outcome) => self.finish_write(outcome).await,
                Event::CaughtUp(batch) => {
                    self.catch_up = None;
                    if let Some(batch) = batch {
                        self.apply_catch_up(batch).await;
                    }
                }
                Event::Shutdown => break,
            }
            self.start_next_write().await;
        }

        for write in self.queued.drain(..) {
            let _ = write.respond_to.send(Err(KvError::Shutdown));
        }
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.respond_to.send(Err(KvError::Shutdown));
        }
        debug!(node = self.ctx.local, shard = self.shard, "shard replica stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Write { mutation, respond_to } => {
                if self.role.is_leader() {
                    self.queued.push_back(QueuedWrite { mutation, respond_to });
                } else {
                    let _ = respond_to.send(Err(self.not_leader()));
                }
            }
            Command::Read { key, respond_to } => {
                let _ = respond_to.send(self.store.get(&key));
            }
            Command::Replicate {
                leader,
                term,
                prev_term,
                entry,
                respond_to,
            } => self.on_replicate(leader, term, prev_term, entry, respond_to).await,
            Command::Claim {
                candidate,
                term,
                last_sequence,
                last_term,
                respond_to,
            } => {
                let response = self.on_claim(candidate, term, (last_sequence, last_term)).await;
                let _ = respond_to.send(response);
            }
            Command::BeginCampaign { term, respond_to } => {
                let result = self.begin_campaign(term).await;
                let _ = respond_to.send(result);
            }
            Command::BecomeLeader { term, respond_to } => {
                let promoted = self.become_leader(term).await;
                let _ = respond_to.send(promoted);
            }
            Command::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Command::ServeCatchUp { from, respond_to } => {
                let response = self.serve_catch_up(from).await;
                let _ = respond_to.send(response);
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(self.store.snapshot());
            }
            Command::ObserveTerm { term, leader } => self.observe_term(term, leader).await,
            Command::RingChanged => self.ring_changed().await,
            Command::SyncTick => self.start_catch_up(),
            Command::Compact => self.compact().await,
        }
    }

    fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            shard: self.shard,
            role: self.role,
            term: self.terms.term,
            last_sequence: self.wal.last_sequence(),
            last_term: self.wal.last_term(),
            last_applied: self.store.last_applied(),
            keys: self.store.len(),
            wal_bytes: self.wal.len(),
        }
    }

    fn not_leader(&self) -> KvError {
        KvError::NotLeader {
            shard: self.shard,
            leader: self.role.leader(self.ctx.local),
        }
    }

    fn publish(&self) {
        self.ctx.hints.record_local(
            self.shard,
            TermEntry {
                term: self.terms.term,
                leader: self.role.leader(self.ctx.local),
            },
        );
    }

    async fn persist_terms(&mut self) -> Result<()> {
        if let Err(err) = store_terms(&self.terms_path, self.terms).await {
            error!(
                node = self.ctx.local,
                shard = self.shard,
                error = %err,
                "failed to persist term; refusing writes"
            );
            self.ctx.storage.mark_unhealthy();
            return Err(KvError::StorageUnhealthy);
        }
        Ok(())
    }

    /// Moves to `role`, raising the known term to `term` if it is newer.
    async fn transition(&mut self, term: Term, role: ShardRole) {
        let was_leader = self.role.is_leader();
        if term > self.terms.term {
            self.terms.term = term;
            // A failure here has already marked storage unhealthy; stepping
            // down to the newer term must still happen.
            let _ = self.persist_terms().await;
        }
        if self.role != role {
            info!(
                node = self.ctx.local,
                shard = self.shard,
                term = self.terms.term,
                from = ?self.role,
                to = ?role,
                "shard role changed"
            );
            self.role = role;
        }
        if was_leader && !self.role.is_leader() {
            let err_leader = self.role.leader(self.ctx.local);
            for write in self.queued.drain(..) {
                let _ = write.respond_to.send(Err(KvError::NotLeader {
                    shard: self.shard,
                    leader: err_leader,
                }));
            }
        }
        self.publish();
    }

    /// A claim may reuse the highest term seen so far as long as nothing was
    /// granted in it yet: a candidate raises its own term in `begin_campaign`
    /// before asking, and `granted` limits every term to one claim.
    fn can_grant(&self, term: Term) -> bool {
        term >= self.terms.term && term > self.terms.granted
    }

    /// How complete the local log is, ordered the same way elections rank
    /// candidates.
    fn log_position(&self) -> (Sequence, Term) {
        (self.wal.last_sequence(), self.wal.last_term())
    }

    fn stale(&self) -> RejectReason {
        RejectReason::StaleTerm {
            current: self.terms.term.max(self.terms.granted),
        }
    }

    async fn on_claim(&mut self, candidate: NodeId, term: Term, position: (Sequence, Term)) -> Response {
        if !self.can_grant(term) {
            warn!(
                node = self.ctx.local,
                shard = self.shard,
                candidate,
                term,
                current = self.terms.term,
                "rejecting stale leadership claim"
            );
            return Response::Reject { reason: self.stale() };
        }
        let own = self.log_position();
        if position < own {
            info!(
                node = self.ctx.local,
                shard = self.shard,
                candidate,
                candidate_last = position.0,
                candidate_last_term = position.1,
                own_last = own.0,
                own_last_term = own.1,
                "rejecting claim from a candidate with a less complete log"
            );
            return Response::Reject {
                reason: RejectReason::LogBehind { last_sequence: own.0 },
            };
        }
        // The grant stays raised in memory even if it cannot be recorded, so
        // this replica never grants the term to anyone else.
        self.terms.granted = term;
        self.terms.term = term;
        if let Err(err) = self.persist_terms().await {
            return Response::reject(&err);
        }
        self.transition(term, ShardRole::Follower { term, leader: candidate })
            .await;
        Response::Accept
    }

    async fn begin_campaign(&mut self, term: Term) -> Result<()> {
        if !self.can_grant(term) {
            return Err(KvError::StaleTerm {
                received: term,
                current: self.terms.term.max(self.terms.granted),
            });
        }
        self.terms.granted = term;
        self.terms.term = term;
        self.persist_terms().await?;
        self.transition(term, ShardRole::NoLeader).await;
        Ok(())
    }

    async fn become_leader(&mut self, term: Term) -> bool {
        if self.terms.term != term || self.terms.granted != term || self.role != ShardRole::NoLeader {
            return false;
        }
        // A logged but unapplied entry was never acknowledged to a client.
        // Followers still holding it replace it once this term writes there.
        if self.wal.last_sequence() > self.store.last_applied() {
            info!(
                node = self.ctx.local,
                shard = self.shard,
                applied = self.store.last_applied(),
                wal_last = self.wal.last_sequence(),
                "dropping unapplied WAL tail before leading"
            );
            self.rollback().await;
            if self.wal.is_poisoned() {
                return false;
            }
        }
        self.transition(term, ShardRole::Leader { term }).await;
        true
    }

    async fn observe_term(&mut self, term: Term, leader: Option<NodeId>) {
        let local = self.ctx.local;
        let follow = leader.filter(|&l| l != local);
        if term > self.terms.term {
            let role = match follow {
                Some(leader) => ShardRole::Follower { term, leader },
                None => ShardRole::NoLeader,
            };
            if self.role.is_leader() {
                warn!(node = local, shard = self.shard, term, "higher term observed; stepping down");
            }
            self.transition(term, role).await;
        } else if term == self.terms.term && self.role == ShardRole::NoLeader {
            if let Some(leader) = follow {
                self.transition(term, ShardRole::Follower { term, leader }).await;
            }
        }
    }

    async fn ring_changed(&mut self) {
        let ring = self.ctx.ring.snapshot();
        let local = self.ctx.local;
        let orphaned = match self.role {
            ShardRole::Leader { .. } => !ring.is_replica(self.shard, local),
            ShardRole::Follower { leader, .. } => !ring.is_replica(self.shard, leader),
            ShardRole::NoLeader => false,
        };
        if orphaned {
            info!(node = local, shard = self.shard, "replica set changed; dropping leader");
            self.transition(self.terms.term, ShardRole::NoLeader).await;
        }
    }

    fn storage_failed(&mut self, err: &KvError) {
        self.wal.poison();
        self.ctx.storage.mark_unhealthy();
        error!(
            node = self.ctx.local,
            shard = self.shard,
            error = %err,
            "durable storage failed; refusing writes"
        );
    }

    /// Gets the WAL ready for the next append: storage must be healthy, a
    /// poisoned log is re-validated, and any unapplied tail left by an
    /// abandoned write is discarded.
    async fn prepare_append(&mut self) -> Result<()> {
        if !self.ctx.storage.is_healthy() {
            return Err(KvError::StorageUnhealthy);
        }
        if self.wal.is_poisoned() {
            if let Err(err) = self.wal.recover().await {
                self.storage_failed(&err);
                return Err(KvError::StorageUnhealthy);
            }
        }
        let applied = self.store.last_applied();
        if self.wal.last_sequence() > applied {
            warn!(
                node = self.ctx.local,
                shard = self.shard,
                applied,
                wal_last = self.wal.last_sequence(),
                "discarding unapplied WAL tail"
            );
            if let Err(err) = self.wal.truncate_after(applied).await {
                self.storage_failed(&err);
                return Err(KvError::StorageUnhealthy);
            }
        }
        Ok(())
    }

    async fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let appended =
            tokio::time::timeout(self.ctx.config.wal_timeout(), self.wal.append_all(entries)).await;
        match appended {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err @ KvError::Io(_))) => {
                self.storage_failed(&err);
                Err(KvError::StorageUnhealthy)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.storage_failed(&KvError::Timeout);
                Err(KvError::StorageUnhealthy)
            }
        }
    }

    async fn append_and_apply(&mut self, entries: &[Entry]) -> Result<()> {
        self.prepare_append().await?;
        self.append(entries).await?;
        for entry in entries {
            self.store.apply(entry);
        }
        Ok(())
    }

    async fn start_next_write(&mut self) {
        while self.in_flight.is_none() {
            let Some(write) = self.queued.pop_front() else {
                return;
            };
            match self.begin_write(write.mutation).await {
                Ok((entry, term, outcome)) => {
                    self.in_flight = Some(InFlight {
                        entry,
                        term,
                        respond_to: write.respond_to,
                        outcome,
                    });
                }
                Err(err) => {
                    let _ = write.respond_to.send(Err(err));
                }
            }
        }
    }

    async fn begin_write(&mut self, mutation: Mutation) -> Result<(Entry, Term, oneshot::Receiver<CommitResult>)> {
        let ShardRole::Leader { term } = self.role else {
            return Err(self.not_leader());
        };
        let local = self.ctx.local;
        let ring = self.ctx.ring.snapshot();
        if !ring.is_replica(self.shard, local) {
            self.transition(term, ShardRole::NoLeader).await;
            return Err(self.not_leader());
        }
        let quorum = ring.quorum();
        let membership = &self.ctx.membership;
        let alive = ring
            .leader_candidates(self.shard, |node| membership.is_alive(node))
            .len();
        if alive < quorum {
            return Err(KvError::QuorumUnavailable {
                shard: self.shard,
                alive,
                quorum,
            });
        }

        self.prepare_append().await?;
        let last = self.wal.last_sequence();
        let prev_term = self.wal.term_at(last);
        let entry = mutation.into_entry(last + 1, term);
        self.append(std::slice::from_ref(&entry)).await?;
        debug!(node = local, shard = self.shard, term, sequence = entry.sequence, "replicating");

        let followers: Vec<NodeId> = ring
            .replicas(self.shard)
            .iter()
            .copied()
            .filter(|&node| node != local)
            .collect();
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        let request = Request::replicate(self.shard, term, prev_term, &entry);
        let sequence = entry.sequence;
        tokio::spawn(async move {
            let result = fan_out(ctx, term, sequence, followers, quorum - 1, request).await;
            let _ = tx.send(result);
        });
        Ok((entry, term, rx))
    }

    async fn finish_write(&mut self, outcome: Option<CommitResult>) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let still_leader = self.role == ShardRole::Leader { term: flight.term };
        let outcome = outcome.unwrap_or(CommitResult::QuorumUnavailable {
            acks: 1,
            needed: self.ctx.config.quorum(),
        });
        let reply = match outcome {
            _ if !still_leader => {
                debug!(
                    node = self.ctx.local,
                    shard = self.shard,
                    sequence = flight.entry.sequence,
                    "leadership lost during replication; abandoning write"
                );
                self.rollback().await;
                Err(self.not_leader())
            }
            CommitResult::Committed { sequence, acks } => {
                self.store.apply(&flight.entry);
                debug!(
                    node = self.ctx.local,
                    shard = self.shard,
                    sequence,
                    acks,
                    "write committed"
                );
                Ok(sequence)
            }
            CommitResult::Superseded { term } => {
                warn!(
                    node = self.ctx.local,
                    shard = self.shard,
                    term,
                    sequence = flight.entry.sequence,
                    "newer term seen during replication; abandoning write"
                );
                self.rollback().await;
                self.transition(term, ShardRole::NoLeader).await;
                Err(self.not_leader())
            }
            CommitResult::QuorumUnavailable { acks, needed } => {
                warn!(
                    node = self.ctx.local,
                    shard = self.shard,
                    sequence = flight.entry.sequence,
                    acks,
                    needed,
                    "write missed quorum; stepping down"
                );
                self.rollback().await;
                self.transition(self.terms.term, ShardRole::NoLeader).await;
                // Enough replicas looked alive when the write started, so
                // this is a timeout the caller may retry after re-election.
                Err(KvError::Timeout)
            }
        };
        let _ = flight.respond_to.send(reply);
    }

    /// Drops WAL entries past the last applied sequence.
    async fn rollback(&mut self) {
        let applied = self.store.last_applied();
        if self.wal.last_sequence() <= applied {
            return;
        }
        if let Err(err) = self.wal.truncate_after(applied).await {
            self.storage_failed(&err);
        }
    }

    async fn on_replicate(
        &mut self,
        leader: NodeId,
        term: Term,
        prev_term: Option<Term>,
        mut entry: Entry,
        respond_to: oneshot::Sender<Response>,
    ) {
        entry.term = term;
        if term < self.terms.term {
            debug!(
                node = self.ctx.local,
                shard = self.shard,
                leader,
                term,
                current = self.terms.term,
                "rejecting replication from stale leader"
            );
            let _ = respond_to.send(Response::Reject { reason: self.stale() });
            return;
        }
        match self.role {
            ShardRole::Follower { term: t, leader: l } if t == term && l == leader => {}
            ShardRole::Leader { term: t } if t == term => {
                error!(
                    node = self.ctx.local,
                    shard = self.shard,
                    leader,
                    term,
                    "second leader in the same term"
                );
                let _ = respond_to.send(Response::Reject {
                    reason: RejectReason::Other(format!("node {} leads term {term}", self.ctx.local)),
                });
                return;
            }
            _ => {
                self.fail_out_of_order(RejectReason::NotLeader { leader: Some(leader) });
                self.transition(term, ShardRole::Follower { term, leader }).await;
            }
        }

        if entry.sequence <= self.store.last_applied() {
            match self.wal.term_at(entry.sequence) {
                Some(held) if held != entry.term => {
                    warn!(
                        node = self.ctx.local,
                        shard = self.shard,
                        sequence = entry.sequence,
                        held,
                        leader_term = entry.term,
                        "log diverged from leader; discarding conflicting suffix"
                    );
                    if let Err(err) = self.discard_from(entry.sequence).await {
                        let _ = respond_to.send(Response::reject(&err));
                        return;
                    }
                }
                // Redelivery, or an entry compaction folded away.
                _ => {
                    let _ = respond_to.send(Response::Ack);
                    return;
                }
            }
        }

        let next = self.store.last_applied() + 1;
        if entry.sequence == next {
            let held = self.wal.term_at(next - 1);
            if let (Some(expected), Some(held)) = (prev_term, held) {
                if expected != held {
                    let sequence = next - 1;
                    warn!(
                        node = self.ctx.local,
                        shard = self.shard,
                        sequence,
                        held,
                        leader_term = expected,
                        "predecessor diverged from leader; catching up"
                    );
                    let reason = match self.discard_from(sequence).await {
                        Ok(()) => RejectReason::Diverged { sequence },
                        Err(err) => RejectReason::from(&err),
                    };
                    let _ = respond_to.send(Response::Reject { reason });
                    self.start_catch_up();
                    return;
                }
            }
            let response = match self.append_and_apply(std::slice::from_ref(&entry)).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::reject(&err),
            };
            let applied = matches!(response, Response::Ack);
            let _ = respond_to.send(response);
            if applied {
                self.drain_out_of_order().await;
            } else {
                self.fail_out_of_order(RejectReason::StorageUnhealthy);
            }
            return;
        }

        // Missing entries are fetched from the leader right away. Entries
        // close enough to arrive on their own wait in the buffer; anything
        // further ahead is left to the catch-up.
        let gap = entry.sequence - next;
        if gap > self.ctx.config.gap_threshold {
            debug!(node = self.ctx.local, shard = self.shard, gap, "gap too wide; not buffering");
            let _ = respond_to.send(Response::Reject {
                reason: RejectReason::Timeout,
            });
        } else {
            self.out_of_order
                .entry(entry.sequence)
                .or_insert_with(|| Buffered {
                    entry,
                    waiters: Vec::new(),
                })
                .waiters
                .push(respond_to);
        }
        self.start_catch_up();
    }

    /// Applies buffered entries that became contiguous.
    async fn drain_out_of_order(&mut self) {
        loop {
            let next = self.store.last_applied() + 1;
            let Some(&sequence) = self.out_of_order.keys().next() else {
                return;
            };
            if sequence > next {
                return;
            }
            let Some(buffered) = self.out_of_order.remove(&sequence) else {
                return;
            };
            let response = if sequence < next {
                Response::Ack
            } else {
                match self.append_and_apply(std::slice::from_ref(&buffered.entry)).await {
                    Ok(()) => Response::Ack,
                    Err(err) => Response::reject(&err),
                }
            };
            let failed = !matches!(response, Response::Ack);
            for waiter in buffered.waiters {
                let _ = waiter.send(response.clone());
            }
            if failed {
                self.fail_out_of_order(RejectReason::StorageUnhealthy);
                return;
            }
        }
    }

    /// Cuts the log back to before `sequence` and rebuilds the store from
    /// what remains. Buffered entries came from the current leader and stay.
    async fn discard_from(&mut self, sequence: Sequence) -> Result<()> {
        self.prepare_append().await?;
        let rebuilt = match self.wal.truncate_after(sequence.saturating_sub(1)).await {
            Ok(()) => self.wal.replay().await,
            Err(err) => Err(err),
        };
        match rebuilt {
            Ok(replay) => {
                self.store = KvStore::from_entries(&replay.entries);
                info!(
                    node = self.ctx.local,
                    shard = self.shard,
                    from = sequence,
                    last_applied = self.store.last_applied(),
                    "discarded diverged log suffix"
                );
                Ok(())
            }
            Err(err) => {
                self.storage_failed(&err);
                Err(KvError::StorageUnhealthy)
            }
        }
    }

    fn fail_out_of_order(&mut self, reason: RejectReason) {
        for (_, buffered) in std::mem::take(&mut self.out_of_order) {
            for waiter in buffered.waiters {
                let _ = waiter.send(Response::Reject {
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Starts fetching missing entries from the leader unless a fetch is
    /// already running.
    fn start_catch_up(&mut self) {
        if self.catch_up.is_some() {
            return;
        }
        let local = self.ctx.local;
        let source = match self.role {
            ShardRole::Follower { leader, .. } => leader,
            ShardRole::NoLeader => match self.ctx.hints.leader(self.shard) {
                Some(leader) if leader != local => leader,
                _ => return,
            },
            ShardRole::Leader { .. } => return,
        };
        // Re-fetch the last applied entry too, so its term can be compared
        // with the leader's.
        let from = self.store.last_applied().max(1);
        let shard = self.shard;
        let ctx = Arc::clone(&self.ctx);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let envelope = Envelope {
                from: ctx.local,
                request: Request::CatchUpRequest {
                    shard_id: shard,
                    from_sequence: from,
                },
            };
            let call = ctx.transport.call(source, envelope);
            let batch = match tokio::time::timeout(ctx.config.replication_timeout(), call).await {
                Ok(Ok(Response::CatchUp {
                    entries,
                    leader_last_sequence,
                })) => Some(CatchUpBatch {
                    entries,
                    leader_last: leader_last_sequence,
                }),
                Ok(Ok(other)) => {
                    debug!(node = ctx.local, shard, peer = source, response = ?other, "catch-up refused");
                    None
                }
                Ok(Err(err)) => {
                    debug!(node = ctx.local, shard, peer = source, error = %err, "catch-up failed");
                    None
                }
                Err(_) => None,
            };
            let _ = tx.send(batch);
        });
        self.catch_up = Some(rx);
    }

    async fn apply_catch_up(&mut self, batch: CatchUpBatch) {
        if self.role.is_leader() {
            return;
        }
        let applied = self.store.last_applied();
        let conflict = batch
            .entries
            .iter()
            .filter(|entry| entry.sequence <= applied)
            .find(|entry| self.wal.term_at(entry.sequence).is_some_and(|held| held != entry.term))
            .map(|entry| entry.sequence);
        if let Some(sequence) = conflict {
            warn!(
                node = self.ctx.local,
                shard = self.shard,
                sequence,
                "catch-up found a diverged entry"
            );
            if self.discard_from(sequence).await.is_ok() {
                self.start_catch_up();
            }
            return;
        }
        let fresh: Vec<Entry> = batch
            .entries
            .into_iter()
            .filter(|entry| entry.sequence > applied)
            .collect();
        if !fresh.is_empty() {
            if let Err(err) = self.append_and_apply(&fresh).await {
                warn!(node = self.ctx.local, shard = self.shard, error = %err, "could not apply catch-up batch");
                return;
            }
            info!(
                node = self.ctx.local,
                shard = self.shard,
                applied = fresh.len(),
                last_applied = self.store.last_applied(),
                leader_last = batch.leader_last,
                "caught up"
            );
        }
        self.drain_out_of_order().await;
        if !fresh.is_empty() && batch.leader_last > self.store.last_applied() {
            self.start_catch_up();
        }
    }

    async fn serve_catch_up(&mut self, from: Sequence) -> Response {
        let applied = self.store.last_applied();
        match self.wal.read_from(from, self.ctx.config.catchup_batch).await {
            Ok(entries) => {
                let mut budget = CATCH_UP_BYTES;
                let mut batch = Vec::new();
                for entry in entries.into_iter().filter(|entry| entry.sequence <= applied) {
                    let size = entry.key.len() + entry.value.len();
                    if !batch.is_empty() && size > budget {
                        break;
                    }
                    budget = budget.saturating_sub(size);
                    batch.push(entry);
                }
                Response::CatchUp {
                    entries: batch,
                    leader_last_sequence: applied,
                }
            }
            Err(err) => Response::reject(&err),
        }
    }

    async fn compact(&mut self) {
        let Some(retention) = self.ctx.config.wal_retention else {
            return;
        };
        let applied = self.store.last_applied();
        if self.in_flight.is_some() || applied <= retention || self.wal.is_poisoned() {
            return;
        }
        if let Err(err) = self.wal.truncate_before(applied - retention + 1).await {
            warn!(node = self.ctx.local, shard = self.shard, error = %err, "WAL compaction failed");
        }
    }
}

/// Replicates one entry to `followers` and turns the barrier's observations
/// into a commit decision.
async fn fan_out(
    ctx: Arc<ReplicaContext>,
    term: Term,
    sequence: Sequence,
    followers: Vec<NodeId>,
    needed: usize,
    request: Request,
) -> CommitResult {
    let deadline = ctx.config.replication_timeout();
    let outcome = collect_quorum(&followers, needed, term, deadline, |peer| {
        let transport = Arc::clone(&ctx.transport);
        let envelope = Envelope {
            from: ctx.local,
            request: request.clone(),
        };
        async move {
            match tokio::time::timeout(deadline, transport.call(peer, envelope)).await {
                Ok(Ok(Response::Ack)) => FollowerReply::Ack,
                Ok(Ok(Response::Reject { reason })) => FollowerReply::Reject(reason),
                Ok(Ok(other)) => FollowerReply::Reject(RejectReason::Other(format!("unexpected reply {other:?}"))),
                Ok(Err(_)) | Err(_) => FollowerReply::Unreachable,
            }
        }
    })
    .await;

    let acks = outcome.acked.len() + 1;
    if let Some(term) = outcome.higher_term {
        CommitResult::Superseded { term }
    } else if outcome.reached {
        CommitResult::Committed { sequence, acks }
    } else {
        CommitResult::QuorumUnavailable {
            acks,
            needed: needed + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{spawn_monitor, HeartbeatProbe, MonitorConfig};
    use crate::ring::Ring;
    use crate::transport::{LocalNetwork, RequestHandler};
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Every peer answers heartbeats, so membership keeps them ALIVE.
    struct Reachable;

    #[async_trait]
    impl HeartbeatProbe for Reachable {
        async fn probe(&self, _peer: NodeId) -> Option<Term> {
            Some(0)
        }
    }

    /// A peer that answers every request with a fixed function.
    struct Scripted(Box<dyn Fn(Request) -> Response + Send + Sync>);

    #[async_trait]
    impl RequestHandler for Scripted {
        async fn handle(&self, envelope: Envelope) -> Response {
            (self.0)(envelope.request)
        }
    }

    fn scripted(reply: impl Fn(Request) -> Response + Send + Sync + 'static) -> Arc<dyn RequestHandler> {
        Arc::new(Scripted(Box::new(reply)))
    }

    struct Harness {
        _dir: TempDir,
        ctx: Arc<ReplicaContext>,
        network: Arc<LocalNetwork>,
        shutdown: watch::Sender<bool>,
    }

    /// A single-node, single-shard context with replication factor 1.
    fn harness() -> Harness {
        harness_with(&[1], 1)
    }

    /// Node 1 of `peers`, holding the only shard. Other peers are not
    /// registered on the network until a test registers them.
    fn harness_with(peers: &[NodeId], replication_factor: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let addrs: Map<NodeId, std::net::SocketAddr> = peers
            .iter()
            .map(|&id| (id, format!("127.0.0.1:{id}").parse().unwrap()))
            .collect();
        let mut config = Config::new(1, addrs, dir.path());
        config.shard_count = 1;
        config.replication_factor = replication_factor;
        config.replication_timeout_ms = 200;
        let config = Arc::new(config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let membership = spawn_monitor(
            MonitorConfig {
                local: 1,
                peers: peers.to_vec(),
                interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(50),
                suspect_after: 1,
                dead_after: 1,
            },
            Arc::new(Reachable),
            shutdown_rx,
        );
        let network = LocalNetwork::new();
        let ctx = Arc::new(ReplicaContext {
            local: 1,
            ring: Arc::new(RingHandle::new(Ring::from_config(&config))),
            config,
            membership,
            transport: network.transport(1),
            hints: Arc::new(RoutingHints::new()),
            storage: Arc::new(StorageHealth::default()),
        });
        Harness {
            _dir: dir,
            ctx,
            network,
            shutdown,
        }
    }

    impl Harness {
        async fn replica(&self) -> ShardHandle {
            spawn_replica(Arc::clone(&self.ctx), 0, self.shutdown.subscribe())
                .await
                .unwrap()
        }
    }

    async fn lead(handle: &ShardHandle, term: Term) {
        handle.begin_campaign(term).await.unwrap();
        assert!(handle.become_leader(term).await.unwrap());
    }

    fn put(key: &str, value: &str) -> Mutation {
        Mutation::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn leader_writes_and_reads_back() {
        let h = harness();
        let shard = h.replica().await;
        assert!(matches!(
            shard.write(put("a", "1")).await,
            Err(KvError::NotLeader { shard: 0, leader: None })
        ));

        lead(&shard, 1).await;
        assert_eq!(shard.write(put("a", "1")).await.unwrap(), 1);
        assert_eq!(shard.write(put("b", "2")).await.unwrap(), 2);
        assert_eq!(
            shard.write(Mutation::Delete { key: "a".into() }).await.unwrap(),
            3
        );
        assert!(matches!(shard.read("a").await, Err(KvError::NotFound)));
        assert_eq!(shard.read("b").await.unwrap(), b"2".to_vec());

        let status = shard.status().await.unwrap();
        assert_eq!(status.role, ShardRole::Leader { term: 1 });
        assert_eq!(status.last_applied, 3);
        assert_eq!(status.keys, 1);
        assert_eq!(h.ctx.hints.leader(0), Some(1));
    }

    #[tokio::test]
    async fn restart_replays_wal_and_remembers_term() {
        let h = harness();
        let shard = h.replica().await;
        lead(&shard, 4).await;
        shard.write(put("k", "v")).await.unwrap();
        h.shutdown.send(true).unwrap();
        drop(shard);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_tx, rx) = watch::channel(false);
        let reopened = spawn_replica(Arc::clone(&h.ctx), 0, rx).await.unwrap();
        assert_eq!(reopened.read("k").await.unwrap(), b"v".to_vec());
        let status = reopened.status().await.unwrap();
        assert_eq!(status.term, 4);
        assert_eq!(status.role, ShardRole::NoLeader);
        // Term 4 was already granted before the restart.
        assert!(matches!(
            reopened.claim(2, 4, 10, 4).await.unwrap(),
            Response::Reject { reason: RejectReason::StaleTerm { current: 4 } }
        ));
    }

    #[tokio::test]
    async fn claims_need_a_newer_term_and_a_long_enough_log() {
        let h = harness();
        let shard = h.replica().await;
        shard.begin_campaign(3).await.unwrap();

        assert_eq!(
            shard.claim(2, 2, 0, 0).await.unwrap(),
            Response::Reject { reason: RejectReason::StaleTerm { current: 3 } }
        );
        assert_eq!(
            shard.claim(2, 3, 0, 0).await.unwrap(),
            Response::Reject { reason: RejectReason::StaleTerm { current: 3 } }
        );
        assert_eq!(shard.claim(2, 5, 0, 0).await.unwrap(), Response::Accept);
        assert_eq!(
            shard.status().await.unwrap().role,
            ShardRole::Follower { term: 5, leader: 2 }
        );

        shard.replicate(2, 5, None, Entry::put(1, "x", "1")).await.unwrap();
        assert_eq!(
            shard.claim(3, 6, 0, 0).await.unwrap(),
            Response::Reject { reason: RejectReason::LogBehind { last_sequence: 1 } }
        );
        // Same length, but its last entry is from an older term.
        assert_eq!(
            shard.claim(3, 7, 1, 4).await.unwrap(),
            Response::Reject { reason: RejectReason::LogBehind { last_sequence: 1 } }
        );
        assert_eq!(shard.claim(3, 8, 1, 5).await.unwrap(), Response::Accept);
        assert!(!shard.become_leader(5).await.unwrap());
    }

    #[tokio::test]
    async fn observed_term_can_be_granted_once() {
        let h = harness();
        let shard = h.replica().await;
        shard.observe_term(4, None).await;
        assert_eq!(shard.status().await.unwrap().term, 4);

        assert_eq!(shard.claim(2, 4, 0, 0).await.unwrap(), Response::Accept);
        assert_eq!(
            shard.claim(3, 4, 0, 0).await.unwrap(),
            Response::Reject { reason: RejectReason::StaleTerm { current: 4 } }
        );
        assert_eq!(
            shard.status().await.unwrap().role,
            ShardRole::Follower { term: 4, leader: 2 }
        );
    }

    #[tokio::test]
    async fn follower_buffers_out_of_order_entries() {
        let h = harness();
        let shard = h.replica().await;
        assert_eq!(shard.claim(2, 1, 0, 0).await.unwrap(), Response::Accept);

        let early = {
            let shard = shard.clone();
            tokio::spawn(async move { shard.replicate(2, 1, Some(1), Entry::put(2, "b", "2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!early.is_finished());

        assert_eq!(shard.replicate(2, 1, None, Entry::put(1, "a", "1")).await.unwrap(), Response::Ack);
        assert_eq!(early.await.unwrap().unwrap(), Response::Ack);
        assert_eq!(shard.status().await.unwrap().last_applied, 2);
        assert_eq!(shard.read("b").await.unwrap(), b"2".to_vec());

        // Redelivery is acknowledged without being applied twice.
        assert_eq!(
            shard.replicate(2, 1, None, Entry::put(1, "a", "other")).await.unwrap(),
            Response::Ack
        );
        assert_eq!(shard.read("a").await.unwrap(), b"1".to_vec());
    }

    #[tokio::test]
    async fn stale_leader_replication_is_rejected_and_leader_steps_down() {
        let h = harness();
        let shard = h.replica().await;
        lead(&shard, 2).await;

        assert_eq!(
            shard.replicate(9, 1, None, Entry::put(1, "x", "y")).await.unwrap(),
            Response::Reject { reason: RejectReason::StaleTerm { current: 2 } }
        );

        shard.observe_term(3, Some(2)).await;
        let status = shard.status().await.unwrap();
        assert_eq!(status.role, ShardRole::Follower { term: 3, leader: 2 });
        assert!(matches!(
            shard.write(put("a", "1")).await,
            Err(KvError::NotLeader { leader: Some(2), .. })
        ));
    }

    #[tokio::test]
    async fn unhealthy_storage_refuses_writes_until_cleared() {
        let h = harness();
        let shard = h.replica().await;
        lead(&shard, 1).await;

        h.ctx.storage.mark_unhealthy();
        assert!(matches!(shard.write(put("a", "1")).await, Err(KvError::StorageUnhealthy)));
        assert!(matches!(
            shard.replicate(1, 1, None, Entry::put(1, "a", "1")).await.unwrap(),
            Response::Reject { .. }
        ));

        h.ctx.storage.mark_healthy();
        assert_eq!(shard.write(put("a", "1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn serves_catch_up_batches_in_order() {
        let h = harness();
        let shard = h.replica().await;
        lead(&shard, 1).await;
        for i in 0..5 {
            shard.write(put(&format!("k{i}"), "v")).await.unwrap();
        }
        match shard.serve_catch_up(3).await.unwrap() {
            Response::CatchUp {
                entries,
                leader_last_sequence,
            } => {
                let sequences: Vec<_> = entries.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![3, 4, 5]);
                assert_eq!(leader_last_sequence, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn entry_from_a_deposed_leader_is_replaced_not_acknowledged() {
        let h = harness();
        let shard = h.replica().await;
        assert_eq!(shard.claim(2, 1, 0, 0).await.unwrap(), Response::Accept);
        assert_eq!(
            shard.replicate(2, 1, None, Entry::put(1, "a", "old")).await.unwrap(),
            Response::Ack
        );

        // Node 3 won term 2 without that entry and wrote its own sequence 1.
        assert_eq!(
            shard.replicate(3, 2, None, Entry::put(1, "b", "new")).await.unwrap(),
            Response::Ack
        );
        assert_eq!(shard.read("b").await.unwrap(), b"new".to_vec());
        assert!(matches!(shard.read("a").await, Err(KvError::NotFound)));
        let status = shard.status().await.unwrap();
        assert_eq!(status.role, ShardRole::Follower { term: 2, leader: 3 });
        assert_eq!((status.last_sequence, status.last_applied, status.last_term), (1, 1, 2));

        h.shutdown.send(true).unwrap();
        drop(shard);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_tx, rx) = watch::channel(false);
        let reopened = spawn_replica(Arc::clone(&h.ctx), 0, rx).await.unwrap();
        assert_eq!(reopened.read("b").await.unwrap(), b"new".to_vec());
        assert!(matches!(reopened.read("a").await, Err(KvError::NotFound)));
    }

    #[tokio::test]
    async fn predecessor_term_mismatch_cuts_the_log_back() {
        let h = harness();
        let shard = h.replica().await;
        assert_eq!(shard.claim(2, 1, 0, 0).await.unwrap(), Response::Accept);
        shard.replicate(2, 1, None, Entry::put(1, "a", "1")).await.unwrap();
        shard.replicate(2, 1, Some(1), Entry::put(2, "b", "stale")).await.unwrap();

        // The term 3 leader holds sequence 2 from term 2, not term 1.
        assert_eq!(
            shard.replicate(3, 3, Some(2), Entry::put(3, "c", "1")).await.unwrap(),
            Response::Reject { reason: RejectReason::Diverged { sequence: 2 } }
        );
        let status = shard.status().await.unwrap();
        assert_eq!((status.last_sequence, status.last_applied), (1, 1));
        assert_eq!(shard.read("a").await.unwrap(), b"1".to_vec());
        assert!(matches!(shard.read("b").await, Err(KvError::NotFound)));
    }

    #[tokio::test]
    async fn catch_up_replaces_a_diverged_suffix() {
        let h = harness();
        let shard = h.replica().await;
        assert_eq!(shard.claim(2, 1, 0, 0).await.unwrap(), Response::Accept);
        shard.replicate(2, 1, None, Entry::put(1, "a", "old")).await.unwrap();

        let history = vec![
            Entry::put(1, "a", "new").in_term(2),
            Entry::put(2, "b", "1").in_term(2),
        ];
        let leader = scripted(move |request| match request {
            Request::CatchUpRequest { from_sequence, .. } => Response::CatchUp {
                entries: history
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect(),
                leader_last_sequence: 2,
            },
            _ => Response::Ack,
        });
        h.network.register(2, &leader);
        shard.sync().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if shard.status().await.unwrap().last_applied == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "catch-up never converged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(shard.read("a").await.unwrap(), b"new".to_vec());
        assert_eq!(shard.read("b").await.unwrap(), b"1".to_vec());
        assert_eq!(shard.status().await.unwrap().last_term, 2);
    }

    #[tokio::test]
    async fn write_that_misses_quorum_is_rolled_back() {
        let h = harness_with(&[1, 2, 3], 3);
        let shard = h.replica().await;
        lead(&shard, 1).await;

        // Nodes 2 and 3 are ALIVE to membership but unreachable.
        assert!(matches!(shard.write(put("a", "1")).await, Err(KvError::Timeout)));
        let status = shard.status().await.unwrap();
        assert_eq!(status.role, ShardRole::NoLeader);
        assert_eq!((status.last_sequence, status.last_applied), (0, 0));
        assert!(matches!(shard.read("a").await, Err(KvError::NotFound)));
        assert!(h.ctx.storage.is_healthy());
    }

    #[tokio::test]
    async fn higher_term_during_replication_rolls_back_and_steps_down() {
        let h = harness_with(&[1, 2, 3], 3);
        let newer = scripted(|_| Response::Reject {
            reason: RejectReason::StaleTerm { current: 7 },
        });
        h.network.register(2, &newer);
        let shard = h.replica().await;
        lead(&shard, 1).await;

        assert!(matches!(
            shard.write(put("a", "1")).await,
            Err(KvError::NotLeader { shard: 0, leader: None })
        ));
        let status = shard.status().await.unwrap();
        assert_eq!(status.term, 7);
        assert_eq!(status.role, ShardRole::NoLeader);
        assert_eq!((status.last_sequence, status.last_applied), (0, 0));

        // The next leader's first entry lands on a clean log.
        lead(&shard, 8).await;
        let acking = scripted(|_| Response::Ack);
        h.network.register(2, &acking);
        assert_eq!(shard.write(put("b", "2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_is_refused_when_the_grant_cannot_be_made_durable() {
        let h = harness();
        let shard = h.replica().await;
        let node_dir = h.ctx.config.node_dir();
        std::fs::create_dir(node_dir.join("shard-0.term.tmp")).unwrap();

        assert_eq!(
            shard.claim(2, 1, 0, 0).await.unwrap(),
            Response::Reject { reason: RejectReason::StorageUnhealthy }
        );
        assert!(!h.ctx.storage.is_healthy());
        assert_eq!(shard.status().await.unwrap().role, ShardRole::NoLeader);
        assert!(matches!(shard.begin_campaign(2).await, Err(KvError::StorageUnhealthy)));
        assert!(!node_dir.join("shard-0.term").exists());
    }

    #[tokio::test]
    async fn catch_up_batches_are_bounded_in_bytes() {
        let h = harness();
        let shard = h.replica().await;
        lead(&shard, 1).await;
        let big = vec![1u8; MAX_ENTRY_LEN - 1024];
        for key in ["a", "b", "c"] {
            shard
                .write(Mutation::Put {
                    key: key.to_string(),
                    value: big.clone(),
                })
                .await
                .unwrap();
        }
        match shard.serve_catch_up(1).await.unwrap() {
            Response::CatchUp {
                entries,
                leader_last_sequence,
            } => {
                assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
                assert_eq!(leader_last_sequence, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
