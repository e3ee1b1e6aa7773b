//! Where to send a request for a shard.
//!
//! Every node keeps a table of what it believes about each shard's
//! leadership. Local shard replicas record their own state; heartbeats merge
//! in what peers believe. A higher term always wins, so a stale entry is
//! replaced as soon as anyone who saw the newer election gossips about it.
//! The table is only a hint: a wrong guess costs one `NotLeader` round trip.

use parking_lot::RwLock;

use crate::entry::{NodeId, ShardId, Term};
use crate::message::{TermEntry, TermTable};

#[derive(Debug, Default)]
pub struct RoutingHints {
    table: RwLock<TermTable>,
}

impl RoutingHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local replica's own view. Ignored if the table already knows
    /// a newer term.
    pub fn record_local(&self, shard: ShardId, entry: TermEntry) {
        let mut table = self.table.write();
        match table.get(&shard) {
            Some(known) if known.term > entry.term => {}
            _ => {
                table.insert(shard, entry);
            }
        }
    }

    /// Merges a peer's table and returns the entries that advanced ours.
    pub fn merge(&self, remote: &TermTable) -> Vec<(ShardId, TermEntry)> {
        let mut table = self.table.write();
        let mut advanced = Vec::new();
        for (&shard, &entry) in remote {
            let newer = match table.get(&shard) {
                None => true,
                Some(known) => {
                    entry.term > known.term
                        || (entry.term == known.term && known.leader.is_none() && entry.leader.is_some())
                }
            };
            if newer {
                table.insert(shard, entry);
                advanced.push((shard, entry));
            }
        }
        advanced
    }

    pub fn get(&self, shard: ShardId) -> Option<TermEntry> {
        self.table.read().get(&shard).copied()
    }

    pub fn leader(&self, shard: ShardId) -> Option<NodeId> {
        self.get(shard).and_then(|entry| entry.leader)
    }

    pub fn snapshot(&self) -> TermTable {
        self.table.read().clone()
    }

    /// Highest term known for any shard.
    pub fn max_term(&self) -> Term {
        self.table.read().values().map(|e| e.term).max().unwrap_or(0)
    }
}

/// Picks which replica serves a read: this node if it holds a copy, else
/// the known leader, else the first reachable replica.
pub fn read_target(
    local: NodeId,
    replicas: &[NodeId],
    leader: Option<NodeId>,
    is_alive: impl Fn(NodeId) -> bool,
) -> Option<NodeId> {
    if replicas.contains(&local) {
        return Some(local);
    }
    if let Some(leader) = leader.filter(|l| replicas.contains(l) && is_alive(*l)) {
        return Some(leader);
    }
    replicas.iter().copied().find(|&node| is_alive(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, leader: Option<NodeId>) -> TermEntry {
        TermEntry { term, leader }
    }

    #[test]
    fn higher_term_wins_merge() {
        let hints = RoutingHints::new();
        hints.record_local(0, entry(3, Some(1)));

        let advanced = hints.merge(&TermTable::from([(0, entry(2, Some(2))), (1, entry(1, Some(3)))]));
        assert_eq!(advanced, vec![(1, entry(1, Some(3)))]);
        assert_eq!(hints.leader(0), Some(1));

        let advanced = hints.merge(&TermTable::from([(0, entry(4, Some(2)))]));
        assert_eq!(advanced, vec![(0, entry(4, Some(2)))]);
        assert_eq!(hints.leader(0), Some(2));
        assert_eq!(hints.max_term(), 4);
    }

    #[test]
    fn same_term_fills_unknown_leader() {
        let hints = RoutingHints::new();
        hints.record_local(0, entry(5, None));
        assert_eq!(hints.merge(&TermTable::from([(0, entry(5, Some(2)))])).len(), 1);
        assert!(hints.merge(&TermTable::from([(0, entry(5, None))])).is_empty());
        assert_eq!(hints.leader(0), Some(2));
    }

    #[test]
    fn local_record_never_lowers_term() {
        let hints = RoutingHints::new();
        hints.merge(&TermTable::from([(0, entry(9, Some(3)))]));
        hints.record_local(0, entry(2, Some(1)));
        assert_eq!(hints.get(0), Some(entry(9, Some(3))));
        hints.record_local(0, entry(9, None));
        assert_eq!(hints.leader(0), None);
    }

    #[test]
    fn reads_prefer_local_then_leader() {
        let all_alive = |_: NodeId| true;
        assert_eq!(read_target(2, &[1, 2, 3], Some(1), all_alive), Some(2));
        assert_eq!(read_target(4, &[1, 2, 3], Some(3), all_alive), Some(3));
        assert_eq!(read_target(4, &[1, 2, 3], None, |n| n != 1), Some(2));
        assert_eq!(read_target(4, &[1, 2, 3], Some(3), |n| n == 1), Some(1));
        assert_eq!(read_target(4, &[1, 2], None, |_| false), None);
    }
}
