//! Per-shard leader election.
//!
//! An election round runs on every ALIVE replica of a leaderless shard, but
//! only one of them actually campaigns:
//!
//! 1. Ask every ALIVE replica for its term, last sequence and role. Without
//!    a quorum of answers nothing happens.
//! 2. If someone already leads, stop.
//! 3. The winner is the replica with the highest last sequence, then the
//!    newest term at that sequence, remaining ties going to the lowest node
//!    id. Every replica computes the same winner from
//!    the same answers; all but the winner stop here.
//! 4. The winner bumps the term past every term it saw, grants its own
//!    claim, and sends a `LeadershipClaim` to the others.
//! 5. With a quorum of accepts (itself included) and no higher term seen,
//!    it becomes `Leader(term)`.
//!
//! Replicas grant at most one claim per term and only to a candidate whose
//! log is at least as complete as their own (same ordering as step 3), so
//! two leaders can never share a term and a winner always holds every entry
//! a quorum acknowledged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entry::{NodeId, Sequence, ShardId, Term};
use crate::error::{KvError, Result};
use crate::message::{Envelope, Request, Response, RoleKind};
use crate::replication::{collect_quorum, FollowerReply};
use crate::shard::ShardHandle;
use crate::transport::Transport;

/// What a replica believes about its shard's leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRole {
    NoLeader,
    Leader { term: Term },
    Follower { term: Term, leader: NodeId },
}

impl ShardRole {
    pub fn kind(&self) -> RoleKind {
        match self {
            ShardRole::NoLeader => RoleKind::NoLeader,
            ShardRole::Leader { .. } => RoleKind::Leader,
            ShardRole::Follower { .. } => RoleKind::Follower,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, ShardRole::Leader { .. })
    }

    /// The leader this role points at, seen from node `local`.
    pub fn leader(&self, local: NodeId) -> Option<NodeId> {
        match *self {
            ShardRole::NoLeader => None,
            ShardRole::Leader { .. } => Some(local),
            ShardRole::Follower { leader, .. } => Some(leader),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStatus {
    pub node: NodeId,
    pub term: Term,
    pub last_sequence: Sequence,
    /// Term of the entry at `last_sequence`.
    pub last_term: Term,
    pub role: RoleKind,
}

impl CandidateStatus {
    /// How complete this candidate's log is; larger is more complete.
    pub fn log_position(&self) -> (Sequence, Term) {
        (self.last_sequence, self.last_term)
    }
}

/// Most complete log wins; ties go to the lowest node id.
pub fn choose_leader(candidates: &[CandidateStatus]) -> Option<NodeId> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.log_position()
                .cmp(&b.log_position())
                .then_with(|| b.node.cmp(&a.node))
        })
        .map(|c| c.node)
}

/// One past the highest term any candidate reported.
pub fn next_term(candidates: &[CandidateStatus]) -> Term {
    candidates.iter().map(|c| c.term).max().unwrap_or(0) + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Elected { term: Term },
    LeaderExists { leader: NodeId },
    /// Another replica is the rightful winner and will campaign itself.
    Deferred { winner: NodeId },
    NoQuorum { responders: usize, quorum: usize },
    Rejected { accepts: usize, quorum: usize },
    Superseded { term: Term },
}

/// One election round for one shard, run from `local`.
pub struct Campaign<'a> {
    pub local: NodeId,
    pub shard: ShardId,
    /// ALIVE replicas of the shard, `local` included.
    pub candidates: Vec<NodeId>,
    pub quorum: usize,
    pub replica: &'a ShardHandle,
    pub transport: &'a Arc<dyn Transport>,
    pub rpc_timeout: Duration,
}

impl Campaign<'_> {
    pub async fn run(&self) -> Result<ElectionOutcome> {
        let statuses = self.gather().await?;
        if statuses.len() < self.quorum {
            return Ok(ElectionOutcome::NoQuorum {
                responders: statuses.len(),
                quorum: self.quorum,
            });
        }
        if let Some(leader) = statuses.iter().find(|s| s.role == RoleKind::Leader) {
            return Ok(ElectionOutcome::LeaderExists { leader: leader.node });
        }
        let Some(winner) = choose_leader(&statuses) else {
            return Ok(ElectionOutcome::NoQuorum {
                responders: 0,
                quorum: self.quorum,
            });
        };
        if winner != self.local {
            debug!(node = self.local, shard = self.shard, winner, "deferring to election winner");
            return Ok(ElectionOutcome::Deferred { winner });
        }

        let term = next_term(&statuses);
        match self.replica.begin_campaign(term).await {
            Ok(()) => {}
            Err(KvError::StaleTerm { current, .. }) => {
                return Ok(ElectionOutcome::Superseded { term: current });
            }
            Err(err) => return Err(err),
        }
        let (last_sequence, last_term) = statuses
            .iter()
            .find(|s| s.node == self.local)
            .map_or((0, 0), CandidateStatus::log_position);
        info!(
            node = self.local,
            shard = self.shard,
            term,
            last_sequence,
            last_term,
            "campaigning for shard leadership"
        );

        let voters: Vec<NodeId> = statuses
            .iter()
            .map(|s| s.node)
            .filter(|&node| node != self.local)
            .collect();
        let claim = Request::LeadershipClaim {
            shard_id: self.shard,
            term,
            candidate_id: self.local,
            last_sequence,
            last_term,
        };
        let outcome = collect_quorum(&voters, self.quorum - 1, term, self.rpc_timeout, |peer| {
            let call = self.call(peer, claim.clone());
            async move {
                match call.await {
                    Ok(Response::Accept) => FollowerReply::Ack,
                    Ok(Response::Reject { reason }) => FollowerReply::Reject(reason),
                    Ok(_) | Err(_) => FollowerReply::Unreachable,
                }
            }
        })
        .await;

        if let Some(higher) = outcome.higher_term {
            self.replica.observe_term(higher, None).await;
            return Ok(ElectionOutcome::Superseded { term: higher });
        }
        let accepts = outcome.acked.len() + 1;
        if !outcome.reached {
            info!(
                node = self.local,
                shard = self.shard,
                term,
                accepts,
                quorum = self.quorum,
                "claim did not reach quorum"
            );
            return Ok(ElectionOutcome::Rejected {
                accepts,
                quorum: self.quorum,
            });
        }
        if self.replica.become_leader(term).await? {
            info!(node = self.local, shard = self.shard, term, accepts, "became shard leader");
            Ok(ElectionOutcome::Elected { term })
        } else {
            Ok(ElectionOutcome::Superseded { term })
        }
    }

    /// Builds a `'static` call so it can run on its own task.
    fn call(&self, peer: NodeId, request: Request) -> impl Future<Output = Result<Response>> + Send + 'static {
        let transport = Arc::clone(self.transport);
        let envelope = Envelope {
            from: self.local,
            request,
        };
        let limit = self.rpc_timeout;
        async move {
            match tokio::time::timeout(limit, transport.call(peer, envelope)).await {
                Ok(result) => result,
                Err(_) => Err(KvError::Timeout),
            }
        }
    }

    /// Collects the status of every candidate that answers in time.
    async fn gather(&self) -> Result<Vec<CandidateStatus>> {
        let own = self.replica.status().await?;
        let mut statuses = vec![CandidateStatus {
            node: self.local,
            term: own.term,
            last_sequence: own.last_sequence,
            last_term: own.last_term,
            role: own.role.kind(),
        }];

        let remote = self
            .candidates
            .iter()
            .copied()
            .filter(|&node| node != self.local)
            .map(|node| {
                let call = self.call(node, Request::ShardStatusRequest { shard_id: self.shard });
                async move { (node, call.await) }
            });
        for (node, reply) in join_all(remote).await {
            match reply {
                Ok(Response::ShardStatus {
                    term,
                    last_sequence,
                    last_term,
                    role,
                }) => statuses.push(CandidateStatus {
                    node,
                    term,
                    last_sequence,
                    last_term,
                    role,
                }),
                Ok(other) => debug!(peer = node, response = ?other, "unexpected status reply"),
                Err(err) => debug!(peer = node, error = %err, "status request failed"),
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(node: NodeId, term: Term, last_sequence: Sequence) -> CandidateStatus {
        CandidateStatus {
            node,
            term,
            last_sequence,
            last_term: term,
            role: RoleKind::NoLeader,
        }
    }

    #[test]
    fn highest_sequence_wins() {
        let candidates = [status(1, 3, 10), status(2, 3, 12), status(3, 4, 11)];
        assert_eq!(choose_leader(&candidates), Some(2));
    }

    #[test]
    fn newer_last_term_breaks_sequence_ties() {
        let mut stale = status(1, 5, 8);
        stale.last_term = 2;
        let mut fresh = status(2, 5, 8);
        fresh.last_term = 4;
        assert_eq!(choose_leader(&[stale, fresh]), Some(2));
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let candidates = [status(3, 1, 7), status(1, 1, 7), status(2, 1, 7)];
        assert_eq!(choose_leader(&candidates), Some(1));
    }

    #[test]
    fn no_candidates_no_winner() {
        assert_eq!(choose_leader(&[]), None);
        assert_eq!(next_term(&[]), 1);
    }

    #[test]
    fn next_term_exceeds_every_observed_term() {
        let candidates = [status(1, 3, 0), status(2, 7, 0), status(3, 5, 0)];
        assert_eq!(next_term(&candidates), 8);
    }

    #[test]
    fn role_reports_leader() {
        assert_eq!(ShardRole::NoLeader.leader(1), None);
        assert_eq!(ShardRole::Leader { term: 2 }.leader(1), Some(1));
        assert_eq!(ShardRole::Follower { term: 2, leader: 3 }.leader(1), Some(3));
        assert!(ShardRole::Leader { term: 1 }.is_leader());
        assert_eq!(ShardRole::Follower { term: 2, leader: 3 }.kind(), RoleKind::Follower);
    }
}
