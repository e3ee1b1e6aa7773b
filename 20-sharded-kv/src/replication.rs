//! Quorum math and the replication fan-out/fan-in barrier.
//!
//! The leader sends an entry to every follower at once and waits until enough
//! of them acknowledge. Each send runs in its own task, so followers that are
//! slower than the quorum still receive the entry after the caller has moved
//! on; they are never retried inline. Followers that miss it entirely are
//! reconciled by catch-up.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::entry::{NodeId, Sequence, Term};
use crate::message::RejectReason;

/// Acknowledgments needed to commit with `replication_factor` replicas,
/// counting the leader's own.
pub fn quorum(replication_factor: usize) -> usize {
    replication_factor / 2 + 1
}

/// How one follower answered a replication or claim message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowerReply {
    Ack,
    Reject(RejectReason),
    /// Transport failure or per-call timeout.
    Unreachable,
}

/// What the barrier observed by the time it returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuorumOutcome {
    pub acked: Vec<NodeId>,
    pub rejected: Vec<(NodeId, RejectReason)>,
    pub unreachable: Vec<NodeId>,
    /// Highest term reported by a follower that rejected us as stale.
    pub higher_term: Option<Term>,
    pub reached: bool,
}

impl QuorumOutcome {
    fn observe(&mut self, node: NodeId, reply: FollowerReply, current_term: Term) {
        match reply {
            FollowerReply::Ack => self.acked.push(node),
            FollowerReply::Reject(reason) => {
                if let RejectReason::StaleTerm { current } = reason {
                    if current > current_term {
                        self.higher_term = Some(self.higher_term.map_or(current, |t| t.max(current)));
                    }
                }
                self.rejected.push((node, reason));
            }
            FollowerReply::Unreachable => self.unreachable.push(node),
        }
    }
}

/// Final result of replicating one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Committed { sequence: Sequence, acks: usize },
    /// Quorum was not reached before the deadline.
    QuorumUnavailable { acks: usize, needed: usize },
    /// A follower reported a newer term; the attempt was abandoned.
    Superseded { term: Term },
}

/// Sends to every follower concurrently and returns once `needed` follower
/// acks arrived, a higher term was observed, every follower answered, or
/// `deadline` elapsed, whichever comes first.
///
/// `needed` excludes the leader itself.
pub async fn collect_quorum<F, Fut>(
    followers: &[NodeId],
    needed: usize,
    current_term: Term,
    deadline: Duration,
    send: F,
) -> QuorumOutcome
where
    F: Fn(NodeId) -> Fut,
    Fut: Future<Output = FollowerReply> + Send + 'static,
{
    let mut outcome = QuorumOutcome::default();
    if needed == 0 {
        outcome.reached = true;
    }

    let (tx, mut rx) = mpsc::channel(followers.len().max(1));
    for &follower in followers {
        let tx = tx.clone();
        let call = send(follower);
        tokio::spawn(async move {
            let reply = call.await;
            let _ = tx.send((follower, reply)).await;
        });
    }
    drop(tx);

    if outcome.reached {
        return outcome;
    }

    let expires = Instant::now() + deadline;
    loop {
        let next = tokio::time::timeout_at(expires, rx.recv()).await;
        match next {
            Ok(Some((node, reply))) => {
                debug!(peer = node, ?reply, "follower replied");
                outcome.observe(node, reply, current_term);
                if outcome.higher_term.is_some() {
                    break;
                }
                if outcome.acked.len() >= needed {
                    outcome.reached = true;
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    acked = outcome.acked.len(),
                    needed,
                    "quorum deadline elapsed"
                );
                break;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[tokio::test]
    async fn commits_without_the_slow_follower() {
        let started = Instant::now();
        let outcome = collect_quorum(&[2, 3], 1, 1, Duration::from_secs(5), |node| async move {
            if node == 3 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            FollowerReply::Ack
        })
        .await;
        assert!(outcome.reached);
        assert_eq!(outcome.acked, vec![2]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn times_out_without_quorum() {
        let outcome = collect_quorum(&[2, 3], 2, 1, Duration::from_millis(50), |node| async move {
            if node == 3 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            FollowerReply::Ack
        })
        .await;
        assert!(!outcome.reached);
        assert_eq!(outcome.acked, vec![2]);
    }

    #[tokio::test]
    async fn stale_term_rejection_abandons_round() {
        let outcome = collect_quorum(&[2, 3, 4, 5], 2, 4, Duration::from_secs(5), |node| async move {
            match node {
                2 => FollowerReply::Reject(RejectReason::StaleTerm { current: 6 }),
                _ => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    FollowerReply::Ack
                }
            }
        })
        .await;
        assert!(!outcome.reached);
        assert_eq!(outcome.higher_term, Some(6));
    }

    #[tokio::test]
    async fn unreachable_followers_end_round_early() {
        let outcome = collect_quorum(&[2, 3], 1, 1, Duration::from_secs(5), |_| async {
            FollowerReply::Unreachable
        })
        .await;
        assert!(!outcome.reached);
        assert_eq!(outcome.unreachable.len(), 2);
    }

    #[tokio::test]
    async fn laggards_still_receive_after_quorum() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let outcome = collect_quorum(&[2, 3], 1, 1, Duration::from_secs(5), move |node| {
            let counter = Arc::clone(&counter);
            async move {
                if node == 3 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                FollowerReply::Ack
            }
        })
        .await;
        assert!(outcome.reached);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_followers_needed_commits_immediately() {
        let outcome = collect_quorum(&[], 0, 1, Duration::from_millis(10), |_| async {
            FollowerReply::Ack
        })
        .await;
        assert!(outcome.reached);
    }
}
