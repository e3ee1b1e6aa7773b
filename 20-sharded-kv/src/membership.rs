//! Heartbeat-driven failure detection.
//!
//! Each peer gets its own probe task that sends a heartbeat every interval
//! and reports the outcome over a channel. A single monitor task owns the
//! [`FailureDetector`] table, so the per-peer state machines are only ever
//! touched by one task. The monitor publishes:
//!
//! - the latest [`MembershipView`] through a `watch` channel, for readers
//!   that only care about the current state
//! - every [`Transition`] through a `broadcast` channel, for the ring and
//!   leader election
//!
//! A single missed heartbeat means nothing. A peer is SUSPECT after
//! `suspect_after` consecutive misses and DEAD after `dead_after` more; one
//! successful heartbeat brings it back to ALIVE.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::entry::{NodeId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub last_heartbeat: Option<Instant>,
    pub last_latency: Option<Duration>,
    /// Consecutive missed heartbeats.
    pub missed: u32,
    /// Highest shard term seen in this node's heartbeats.
    pub term: Term,
}

impl NodeState {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Alive,
            last_heartbeat: None,
            last_latency: None,
            missed: 0,
            term: 0,
        }
    }
}

/// A status change of one observed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub node: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Per-peer ALIVE → SUSPECT → DEAD state machines.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    suspect_after: u32,
    dead_after: u32,
    peers: BTreeMap<NodeId, NodeState>,
}

impl FailureDetector {
    /// Every peer starts ALIVE.
    pub fn new(suspect_after: u32, dead_after: u32, peers: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            suspect_after,
            dead_after,
            peers: peers.into_iter().map(|id| (id, NodeState::new(id))).collect(),
        }
    }

    pub fn record_success(&mut self, node: NodeId, latency: Duration, now: Instant) -> Option<Transition> {
        let state = self.peers.get_mut(&node)?;
        state.missed = 0;
        state.last_heartbeat = Some(now);
        state.last_latency = Some(latency);
        let from = state.status;
        if from == NodeStatus::Alive {
            return None;
        }
        state.status = NodeStatus::Alive;
        Some(Transition {
            node,
            from,
            to: NodeStatus::Alive,
        })
    }

    pub fn record_miss(&mut self, node: NodeId) -> Option<Transition> {
        let state = self.peers.get_mut(&node)?;
        state.missed = state.missed.saturating_add(1);
        let next = match state.status {
            NodeStatus::Alive if state.missed >= self.suspect_after => NodeStatus::Suspect,
            NodeStatus::Suspect if state.missed >= self.suspect_after + self.dead_after => NodeStatus::Dead,
            _ => return None,
        };
        let from = std::mem::replace(&mut state.status, next);
        Some(Transition {
            node,
            from,
            to: next,
        })
    }

    pub fn observe_term(&mut self, node: NodeId, term: Term) {
        if let Some(state) = self.peers.get_mut(&node) {
            state.term = state.term.max(term);
        }
    }

    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.peers.get(&node).map(|s| s.status)
    }

    pub fn states(&self) -> impl Iterator<Item = &NodeState> {
        self.peers.values()
    }
}

/// Snapshot of every known node's state as seen by `local`.
#[derive(Debug, Clone)]
pub struct MembershipView {
    pub local: NodeId,
    pub peers: BTreeMap<NodeId, NodeState>,
}

impl MembershipView {
    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        if node == self.local {
            return Some(NodeStatus::Alive);
        }
        self.peers.get(&node).map(|s| s.status)
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.status(node) == Some(NodeStatus::Alive)
    }

    pub fn is_dead(&self, node: NodeId) -> bool {
        self.status(node) == Some(NodeStatus::Dead)
    }
}

/// Performs one heartbeat round trip with a peer.
#[async_trait]
pub trait HeartbeatProbe: Send + Sync + 'static {
    /// Returns the highest term the peer reported, or `None` when it did not
    /// answer in time.
    async fn probe(&self, peer: NodeId) -> Option<Term>;
}

#[derive(Debug)]
struct ProbeOutcome {
    peer: NodeId,
    reply: Option<Term>,
    latency: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub local: NodeId,
    pub peers: Vec<NodeId>,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub suspect_after: u32,
    pub dead_after: u32,
}

/// Read side of the membership monitor.
#[derive(Clone)]
pub struct MembershipHandle {
    view: watch::Receiver<MembershipView>,
    events: broadcast::Sender<Transition>,
}

impl MembershipHandle {
    pub fn view(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.view.borrow().is_alive(node)
    }

    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.view.borrow().status(node)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }
}

/// Starts the monitor task and one probe task per peer.
pub fn spawn_monitor(
    config: MonitorConfig,
    probe: Arc<dyn HeartbeatProbe>,
    shutdown: watch::Receiver<bool>,
) -> MembershipHandle {
    let peers: Vec<NodeId> = config
        .peers
        .iter()
        .copied()
        .filter(|&id| id != config.local)
        .collect();
    let detector = FailureDetector::new(config.suspect_after, config.dead_after, peers.iter().copied());
    let (view_tx, view_rx) = watch::channel(MembershipView {
        local: config.local,
        peers: detector.states().map(|s| (s.node_id, s.clone())).collect(),
    });
    let (events_tx, _) = broadcast::channel(256);
    let (outcome_tx, outcome_rx) = mpsc::channel(peers.len().max(1) * 4);

    for &peer in &peers {
        tokio::spawn(probe_loop(
            peer,
            Arc::clone(&probe),
            config.interval,
            config.probe_timeout,
            outcome_tx.clone(),
            shutdown.clone(),
        ));
    }
    drop(outcome_tx);

    tokio::spawn(monitor_loop(
        config.local,
        detector,
        outcome_rx,
        view_tx,
        events_tx.clone(),
    ));

    MembershipHandle {
        view: view_rx,
        events: events_tx,
    }
}

async fn probe_loop(
    peer: NodeId,
    probe: Arc<dyn HeartbeatProbe>,
    interval: Duration,
    probe_timeout: Duration,
    outcomes: mpsc::Sender<ProbeOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let started = Instant::now();
        let reply = tokio::time::timeout(probe_timeout, probe.probe(peer))
            .await
            .unwrap_or(None);
        let outcome = ProbeOutcome {
            peer,
            reply,
            latency: started.elapsed(),
        };
        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
    debug!(peer, "probe loop stopped");
}

async fn monitor_loop(
    local: NodeId,
    mut detector: FailureDetector,
    mut outcomes: mpsc::Receiver<ProbeOutcome>,
    view: watch::Sender<MembershipView>,
    events: broadcast::Sender<Transition>,
) {
    while let Some(outcome) = outcomes.recv().await {
        let transition = match outcome.reply {
            Some(term) => {
                detector.observe_term(outcome.peer, term);
                detector.record_success(outcome.peer, outcome.latency, Instant::now())
            }
            None => detector.record_miss(outcome.peer),
        };

        view.send_replace(MembershipView {
            local,
            peers: detector.states().map(|s| (s.node_id, s.clone())).collect(),
        });

        if let Some(transition) = transition {
            match transition.to {
                NodeStatus::Alive => info!(node = local, peer = transition.node, from = ?transition.from, "peer is alive"),
                NodeStatus::Suspect => warn!(node = local, peer = transition.node, "peer is suspect"),
                NodeStatus::Dead => warn!(node = local, peer = transition.node, "peer is dead"),
            }
            // No subscribers is fine; the view above is still current.
            let _ = events.send(transition);
        }
    }
    debug!(node = local, "membership monitor stopped");
}
