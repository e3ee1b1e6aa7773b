//! Consistent-hash ring with virtual nodes.
//!
//! The 64-bit hash space is cut into `shard_count` equal, contiguous ranges.
//! Shard ids never change; what membership changes move is each shard's
//! replica set. A shard's replicas are the first `replication_factor`
//! distinct physical nodes found walking clockwise from the shard's upper
//! boundary over the virtual nodes. A virtual node sitting exactly on that
//! boundary owns it.
//!
//! Because every physical node owns many small arcs, adding or removing one
//! node only moves the shards whose walk crosses one of its arcs, roughly
//! `1 / node_count` of them.
//!
//! A [`Ring`] is immutable. Membership changes build a new one and
//! [`RingHandle`] swaps the `Arc` under a lock, so a request that grabbed a
//! snapshot keeps a consistent view for its whole duration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::entry::{NodeId, ShardId};
use crate::replication::quorum;

/// Position of `bytes` on the ring: the first 8 bytes of SHA-256, big-endian.
pub fn hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// A point on the ring owned by one physical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualNode {
    pub point: u64,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub struct Ring {
    shard_count: u32,
    vnodes_per_node: u32,
    replication_factor: usize,
    nodes: BTreeSet<NodeId>,
    vnodes: Vec<VirtualNode>,
    replicas: Vec<Vec<NodeId>>,
}

impl Ring {
    pub fn new(
        shard_count: u32,
        vnodes_per_node: u32,
        replication_factor: usize,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self::build(
            shard_count,
            vnodes_per_node,
            replication_factor,
            nodes.into_iter().collect(),
        )
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.shard_count,
            config.vnodes_per_node,
            config.replication_factor,
            config.peers.keys().copied(),
        )
    }

    fn build(
        shard_count: u32,
        vnodes_per_node: u32,
        replication_factor: usize,
        nodes: BTreeSet<NodeId>,
    ) -> Self {
        let mut vnodes: Vec<VirtualNode> = nodes
            .iter()
            .flat_map(|&node| {
                (0..vnodes_per_node).map(move |index| VirtualNode {
                    point: hash(format!("{node}:{index}").as_bytes()),
                    node,
                })
            })
            .collect();
        vnodes.sort_unstable();

        let mut ring = Self {
            shard_count,
            vnodes_per_node,
            replication_factor,
            nodes,
            vnodes,
            replicas: Vec::new(),
        };
        ring.replicas = (0..shard_count)
            .map(|shard| ring.walk(ring.upper_boundary(shard)))
            .collect();
        ring
    }

    /// Collects distinct physical nodes clockwise from `point`, inclusive.
    fn walk(&self, point: u64) -> Vec<NodeId> {
        let wanted = self.replication_factor.min(self.nodes.len());
        let mut owners = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }
        let start = self.vnodes.partition_point(|v| v.point < point);
        for offset in 0..self.vnodes.len() {
            let vnode = self.vnodes[(start + offset) % self.vnodes.len()];
            if !owners.contains(&vnode.node) {
                owners.push(vnode.node);
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }

    /// Last point of the shard's range.
    fn upper_boundary(&self, shard: ShardId) -> u64 {
        let count = u128::from(self.shard_count);
        let next_start = ((u128::from(shard) + 1) << 64).div_ceil(count);
        (next_start - 1) as u64
    }

    /// Maps a key to the shard whose range contains its hash.
    pub fn resolve(&self, key: &str) -> ShardId {
        self.shard_for_point(hash(key.as_bytes()))
    }

    pub fn shard_for_point(&self, point: u64) -> ShardId {
        ((u128::from(point) * u128::from(self.shard_count)) >> 64) as ShardId
    }

    /// Replica set of a shard, in ring order. Empty when the ring is empty.
    pub fn replicas(&self, shard: ShardId) -> &[NodeId] {
        self.replicas
            .get(shard as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First replica of the shard owning `key`.
    pub fn primary_for(&self, key: &str) -> Option<NodeId> {
        self.replicas(self.resolve(key)).first().copied()
    }

    /// Physical node owning the virtual node nearest clockwise of `point`.
    pub fn vnode_owner(&self, point: u64) -> Option<NodeId> {
        if self.vnodes.is_empty() {
            return None;
        }
        let index = self.vnodes.partition_point(|v| v.point < point) % self.vnodes.len();
        Some(self.vnodes[index].node)
    }

    pub fn is_replica(&self, shard: ShardId, node: NodeId) -> bool {
        self.replicas(shard).contains(&node)
    }

    /// Replicas of `shard` that `is_alive` accepts, in ring order.
    pub fn leader_candidates(&self, shard: ShardId, is_alive: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        self.replicas(shard)
            .iter()
            .copied()
            .filter(|&node| is_alive(node))
            .collect()
    }

    /// Shards replicated on `node`.
    pub fn shards_of(&self, node: NodeId) -> Vec<ShardId> {
        (0..self.shard_count)
            .filter(|&shard| self.is_replica(shard, node))
            .collect()
    }

    /// A shard whose replica set cannot reach quorum is unavailable for writes.
    pub fn is_available(&self, shard: ShardId) -> bool {
        self.replicas(shard).len() >= self.quorum()
    }

    pub fn quorum(&self) -> usize {
        quorum(self.replication_factor)
    }

    /// Returns a ring with `node` added and the shards whose replica set changed.
    pub fn add_node(&self, node: NodeId) -> (Ring, BTreeSet<ShardId>) {
        let mut nodes = self.nodes.clone();
        nodes.insert(node);
        self.rebuild(nodes)
    }

    /// Returns a ring without `node` and the shards whose replica set changed.
    pub fn remove_node(&self, node: NodeId) -> (Ring, BTreeSet<ShardId>) {
        let mut nodes = self.nodes.clone();
        nodes.remove(&node);
        self.rebuild(nodes)
    }

    fn rebuild(&self, nodes: BTreeSet<NodeId>) -> (Ring, BTreeSet<ShardId>) {
        let next = Self::build(
            self.shard_count,
            self.vnodes_per_node,
            self.replication_factor,
            nodes,
        );
        let changed = (0..self.shard_count)
            .filter(|&shard| {
                let before: BTreeSet<_> = self.replicas(shard).iter().collect();
                let after: BTreeSet<_> = next.replicas(shard).iter().collect();
                before != after
            })
            .collect();
        (next, changed)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Virtual nodes per physical node.
    pub fn distribution(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self.nodes.iter().map(|&n| (n, 0)).collect();
        for vnode in &self.vnodes {
            *counts.entry(vnode.node).or_default() += 1;
        }
        counts
    }
}

/// Shared pointer to the current ring snapshot.
pub struct RingHandle {
    current: RwLock<Arc<Ring>>,
}

impl RingHandle {
    pub fn new(ring: Ring) -> Self {
        Self {
            current: RwLock::new(Arc::new(ring)),
        }
    }

    /// The snapshot to use for the rest of one request.
    pub fn snapshot(&self) -> Arc<Ring> {
        Arc::clone(&self.current.read())
    }

    pub fn add_node(&self, node: NodeId) -> BTreeSet<ShardId> {
        self.update(|ring| ring.add_node(node))
    }

    pub fn remove_node(&self, node: NodeId) -> BTreeSet<ShardId> {
        self.update(|ring| ring.remove_node(node))
    }

    fn update(&self, change: impl FnOnce(&Ring) -> (Ring, BTreeSet<ShardId>)) -> BTreeSet<ShardId> {
        let mut current = self.current.write();
        let (next, changed) = change(&current);
        *current = Arc::new(next);
        changed
    }
}
