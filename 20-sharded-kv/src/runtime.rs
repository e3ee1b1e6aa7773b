//! Node startup and the background tasks that keep a node in the cluster.
//!
//! [`start_node`] wires every component of a node together and spawns:
//!
//! - the membership monitor, whose heartbeats carry this node's term table
//! - one replica actor per shard
//! - a term-sync task that merges the term tables peers answer with
//! - a membership task that rewires the ring when a peer dies or returns
//! - an election tick with random jitter, for shards that lost their leader
//! - a maintenance tick that asks followers to catch up and compacts WALs
//!
//! Every task stops when [`Node::shutdown`] flips the shared shutdown signal.
//!
//! [`start_local_node`] and [`start_tcp_node`] pick the transport.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::entry::{NodeId, ShardId, Term};
use crate::error::{KvError, Result};
use crate::membership::{spawn_monitor, HeartbeatProbe, MonitorConfig, NodeStatus, Transition};
use crate::message::{Envelope, Request, Response, TermTable};
use crate::node::Node;
use crate::ring::{Ring, RingHandle};
use crate::routing::RoutingHints;
use crate::shard::{spawn_replica, ReplicaContext, StorageHealth};
use crate::transport::{serve, LocalNetwork, RequestHandler, TcpTransport, Transport};

const OBSERVED_TABLES: usize = 64;

/// Heartbeats that gossip the sender's term table both ways.
///
/// Tables peers answer with are forwarded to the term-sync task instead of
/// being merged here, so the monitor never waits on a shard replica.
pub struct HeartbeatSender {
    local: NodeId,
    transport: Arc<dyn Transport>,
    hints: Arc<RoutingHints>,
    observed: mpsc::Sender<TermTable>,
}

#[async_trait]
impl HeartbeatProbe for HeartbeatSender {
    async fn probe(&self, peer: NodeId) -> Option<Term> {
        let envelope = Envelope {
            from: self.local,
            request: Request::Heartbeat {
                from_node: self.local,
                term_table: self.hints.snapshot(),
            },
        };
        match self.transport.call(peer, envelope).await {
            Ok(Response::HeartbeatAck { term_table, .. }) => {
                let highest = term_table.values().map(|e| e.term).max().unwrap_or(0);
                // A full queue only delays gossip until the next heartbeat.
                let _ = self.observed.try_send(term_table);
                Some(highest)
            }
            Ok(other) => {
                debug!(node = self.local, peer, response = ?other, "unexpected heartbeat reply");
                None
            }
            Err(err) => {
                debug!(node = self.local, peer, error = %err, "heartbeat failed");
                None
            }
        }
    }
}

/// Starts a node that talks to its peers through `transport`.
pub async fn start_node(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Node>> {
    config.validate()?;
    let config = Arc::new(config);
    let id = config.node_id;
    tokio::fs::create_dir_all(config.node_dir()).await?;

    let ring = Arc::new(RingHandle::new(Ring::from_config(&config)));
    let hints = Arc::new(RoutingHints::new());
    let storage = Arc::new(StorageHealth::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (observed_tx, observed_rx) = mpsc::channel(OBSERVED_TABLES);

    let probe = Arc::new(HeartbeatSender {
        local: id,
        transport: Arc::clone(&transport),
        hints: Arc::clone(&hints),
        observed: observed_tx,
    });
    let membership = spawn_monitor(
        MonitorConfig {
            local: id,
            peers: config.peers.keys().copied().collect(),
            interval: config.heartbeat_interval(),
            probe_timeout: config.rpc_timeout(),
            suspect_after: config.suspect_after,
            dead_after: config.dead_after,
        },
        probe,
        shutdown_rx.clone(),
    );
    let events = membership.subscribe();

    let ctx = Arc::new(ReplicaContext {
        local: id,
        config: Arc::clone(&config),
        ring: Arc::clone(&ring),
        membership: membership.clone(),
        transport: Arc::clone(&transport),
        hints: Arc::clone(&hints),
        storage: Arc::clone(&storage),
    });
    let mut shards = BTreeMap::new();
    for shard in 0..config.shard_count {
        let handle = spawn_replica(Arc::clone(&ctx), shard, shutdown_rx.clone()).await?;
        shards.insert(shard, handle);
    }

    let node = Arc::new(Node {
        id,
        config,
        ring,
        membership,
        transport,
        hints,
        storage,
        shards,
        shutdown: shutdown_tx,
    });

    tokio::spawn(term_sync_loop(Arc::clone(&node), observed_rx));
    tokio::spawn(membership_loop(Arc::clone(&node), events));
    tokio::spawn(election_loop(Arc::clone(&node)));
    tokio::spawn(maintenance_loop(Arc::clone(&node)));

    info!(
        node = id,
        shards = node.config.shard_count,
        replication_factor = node.config.replication_factor,
        peers = node.config.peers.len(),
        "node started"
    );
    Ok(node)
}

/// Starts a node on an in-process [`LocalNetwork`].
pub async fn start_local_node(config: Config, network: &Arc<LocalNetwork>) -> Result<Arc<Node>> {
    let transport = network.transport(config.node_id);
    let node = start_node(config, transport).await?;
    let handler: Arc<dyn RequestHandler> = node.clone();
    network.register(node.id(), &handler);
    Ok(node)
}

/// Starts a node that serves peers over TCP.
///
/// Binds the node's address from `peers` unless a listener is passed in,
/// which lets tests bind port 0 first.
pub async fn start_tcp_node(config: Config, listener: Option<TcpListener>) -> Result<Arc<Node>> {
    let listener = match listener {
        Some(listener) => listener,
        None => {
            let addr = config.peers.get(&config.node_id).ok_or_else(|| {
                KvError::InvalidConfig(format!("node id {} missing from peers map", config.node_id))
            })?;
            TcpListener::bind(addr).await?
        }
    };
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        config.peers.clone(),
        config.rpc_timeout(),
        config.request_timeout(),
    ));
    let node = start_node(config, transport).await?;
    let handler: Arc<dyn RequestHandler> = node.clone();
    let shutdown = node.shutdown_signal();
    let id = node.id();
    tokio::spawn(async move {
        if let Err(err) = serve(listener, handler, shutdown).await {
            error!(node = id, error = %err, "peer listener failed");
        }
    });
    Ok(node)
}

/// Resolves once the node is shutting down.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        // A dropped sender means the node is gone too.
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn term_sync_loop(node: Arc<Node>, mut observed: mpsc::Receiver<TermTable>) {
    let mut shutdown = node.shutdown_signal();
    loop {
        let table = tokio::select! {
            table = observed.recv() => table,
            _ = stopped(&mut shutdown) => None,
        };
        let Some(table) = table else { break };
        node.absorb_terms(&table).await;
    }
    debug!(node = node.id(), "term sync stopped");
}

async fn membership_loop(node: Arc<Node>, mut events: broadcast::Receiver<Transition>) {
    let mut shutdown = node.shutdown_signal();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = stopped(&mut shutdown) => break,
        };
        match event {
            Ok(transition) => on_transition(&node, transition).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(node = node.id(), skipped, "missed membership events; reconciling ring");
                reconcile_ring(&node).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(node = node.id(), "membership task stopped");
}

async fn on_transition(node: &Node, transition: Transition) {
    let changed = match (transition.from, transition.to) {
        (_, NodeStatus::Dead) => node.ring.remove_node(transition.node),
        (NodeStatus::Dead, NodeStatus::Alive) => node.ring.add_node(transition.node),
        _ => Default::default(),
    };
    if !changed.is_empty() {
        info!(
            node = node.id(),
            peer = transition.node,
            status = ?transition.to,
            shards = changed.len(),
            "ring membership changed"
        );
        notify_ring_changed(node, changed).await;
    }
    if transition.to != NodeStatus::Alive {
        node.run_elections().await;
    }
}

/// Brings the ring in line with the current membership view.
async fn reconcile_ring(node: &Node) {
    let view = node.membership.view();
    let mut changed = BTreeSet::new();
    for (&peer, state) in &view.peers {
        let in_ring = node.ring.snapshot().contains(peer);
        match state.status {
            NodeStatus::Dead if in_ring => changed.extend(node.ring.remove_node(peer)),
            NodeStatus::Alive if !in_ring => changed.extend(node.ring.add_node(peer)),
            _ => {}
        }
    }
    notify_ring_changed(node, changed).await;
    node.run_elections().await;
}

async fn notify_ring_changed(node: &Node, shards: impl IntoIterator<Item = ShardId>) {
    for shard in shards {
        if let Some(handle) = node.shards.get(&shard) {
            handle.ring_changed().await;
        }
    }
}

async fn election_loop(node: Arc<Node>) {
    let mut shutdown = node.shutdown_signal();
    let base = node.config.election_interval();
    loop {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2));
        tokio::select! {
            _ = tokio::time::sleep(base + jitter) => {}
            _ = stopped(&mut shutdown) => break,
        }
        node.run_elections().await;
    }
    debug!(node = node.id(), "election tick stopped");
}

/// Anti-entropy catch-up for every local replica, plus WAL compaction when
/// retention is configured.
async fn maintenance_loop(node: Arc<Node>) {
    let mut shutdown = node.shutdown_signal();
    let mut ticker = tokio::time::interval(node.config.catchup_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        let compacting = node.config.wal_retention.is_some();
        for shard in node.ring.snapshot().shards_of(node.id()) {
            if let Some(handle) = node.shards.get(&shard) {
                handle.sync().await;
                if compacting {
                    handle.compact().await;
                }
            }
        }
    }
    debug!(node = node.id(), "maintenance tick stopped");
}
