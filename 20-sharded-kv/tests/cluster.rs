//! Integration tests for replication and failover on an in-process network.
//!
//! Every node runs its real runtime (heartbeats, elections, replication),
//! only the transport is swapped for a [`LocalNetwork`] so tests can crash
//! and isolate nodes deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use sharded_kv::election::ShardRole;
use sharded_kv::message::{Envelope, RejectReason, Request, Response};
use sharded_kv::runtime::start_local_node;
use sharded_kv::transport::LocalNetwork;
use sharded_kv::{Config, KvError, Node, NodeId, ShardId};
use tempfile::TempDir;

const SHARDS: u32 = 4;
const SETTLE: Duration = Duration::from_secs(10);

fn cluster_config(id: NodeId, size: u64, replication_factor: usize, dir: &TempDir) -> Config {
    let peers = (1..=size)
        .map(|n| (n, format!("127.0.0.1:{}", 7300 + n).parse().unwrap()))
        .collect();
    let mut config = Config::new(id, peers, dir.path());
    config.shard_count = SHARDS;
    config.vnodes_per_node = 16;
    config.replication_factor = replication_factor;
    config.heartbeat_interval_ms = 40;
    config.suspect_after = 2;
    config.dead_after = 3;
    config.rpc_timeout_ms = 100;
    config.replication_timeout_ms = 300;
    config.election_interval_ms = 100;
    config.catchup_interval_ms = 150;
    config.request_timeout_ms = 4000;
    config
}

/// Test harness for a cluster of nodes on one [`LocalNetwork`].
struct TestCluster {
    _dir: TempDir,
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    async fn spawn(size: u64, replication_factor: usize) -> Result<Self> {
        let dir = TempDir::new()?;
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        for id in 1..=size {
            let config = cluster_config(id, size, replication_factor, &dir);
            nodes.push(start_local_node(config, &network).await?);
        }
        Ok(Self {
            _dir: dir,
            network,
            nodes,
        })
    }

    /// Gets a node by 1-indexed ID.
    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[(id - 1) as usize]
    }

    /// Waits until every shard has exactly one leader among `ids`, and
    /// returns the leader of each shard.
    async fn wait_for_leaders(&self, ids: &[NodeId]) -> Result<BTreeMap<ShardId, NodeId>> {
        let start = Instant::now();
        loop {
            let mut leaders: BTreeMap<ShardId, Vec<NodeId>> = BTreeMap::new();
            for &id in ids {
                for shard in self.node(id).status().await?.shards {
                    if shard.role.is_leader() {
                        leaders.entry(shard.shard).or_default().push(id);
                    }
                }
            }
            if leaders.len() == SHARDS as usize && leaders.values().all(|l| l.len() == 1) {
                return Ok(leaders.into_iter().map(|(shard, l)| (shard, l[0])).collect());
            }
            if start.elapsed() > SETTLE {
                bail!("timeout waiting for shard leaders, saw {leaders:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Polls a node's read path until it returns `expected`.
async fn wait_for_value(node: &Node, key: &str, expected: Option<&[u8]>) -> Result<()> {
    let start = Instant::now();
    loop {
        let seen = match node.get(key).await {
            Ok(value) => Some(value),
            Err(KvError::NotFound) => None,
            Err(_) => Some(b"<error>".to_vec()),
        };
        if seen.as_deref() == expected {
            return Ok(());
        }
        if start.elapsed() > SETTLE {
            bail!(
                "node {} never saw {key} = {:?}, last saw {:?}",
                node.id(),
                expected.map(String::from_utf8_lossy),
                seen.as_deref().map(String::from_utf8_lossy)
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicated_writes_reach_every_node() -> Result<()> {
    let cluster = TestCluster::spawn(3, 3).await?;
    cluster.wait_for_leaders(&[1, 2, 3]).await?;

    let first = cluster.node(2).put("user:1", "alice").await?;
    let second = cluster.node(3).put("user:1", "bob").await?;
    assert!(second > first, "sequences grow per shard");
    for id in 1..=3 {
        wait_for_value(cluster.node(id), "user:1", Some(b"bob")).await?;
    }

    cluster.node(1).delete("user:1").await?;
    for id in 1..=3 {
        wait_for_value(cluster.node(id), "user:1", None).await?;
        assert!(!cluster.node(id).contains("user:1").await?);
    }

    let leading: usize = {
        let mut total = 0;
        for id in 1..=3 {
            total += cluster.node(id).status().await?.leading();
        }
        total
    };
    assert_eq!(leading, SHARDS as usize);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_replicas_forward_reads_and_writes() -> Result<()> {
    let cluster = TestCluster::spawn(4, 3).await?;
    cluster.wait_for_leaders(&[1, 2, 3, 4]).await?;

    for i in 0..16 {
        let key = format!("key-{i}");
        let shard = cluster.node(1).shard_for(&key);
        let ring = cluster.node(1).ring();
        let outsider = (1..=4)
            .find(|&id| !ring.replicas(shard).contains(&id))
            .expect("four nodes with three replicas leave one outsider");

        cluster.node(outsider).put(&key, format!("v{i}")).await?;
        wait_for_value(cluster.node(outsider), &key, Some(format!("v{i}").as_bytes())).await?;

        let (write_shard, leader) = cluster.node(outsider).locate_write(&key)?;
        let (read_shard, replica) = cluster.node(outsider).locate_read(&key)?;
        assert_eq!((write_shard, read_shard), (shard, shard));
        assert!(ring.replicas(shard).contains(&leader));
        assert!(ring.replicas(shard).contains(&replica));
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_commit_with_one_replica_down() -> Result<()> {
    let cluster = TestCluster::spawn(3, 3).await?;
    cluster.wait_for_leaders(&[1, 2, 3]).await?;

    cluster.node(3).shutdown();
    cluster.network.isolate(3);

    for i in 0..10 {
        cluster.node(1).put(&format!("k{i}"), format!("v{i}")).await?;
    }
    for i in 0..10 {
        wait_for_value(cluster.node(2), &format!("k{i}"), Some(format!("v{i}").as_bytes())).await?;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_is_replaced_without_losing_writes() -> Result<()> {
    let cluster = TestCluster::spawn(3, 3).await?;
    let leaders = cluster.wait_for_leaders(&[1, 2, 3]).await?;

    cluster.node(1).put("before", "1").await?;
    let shard = cluster.node(1).shard_for("before");
    let old_leader = leaders[&shard];
    let survivors: Vec<NodeId> = (1..=3).filter(|&id| id != old_leader).collect();
    let old_term = cluster.node(old_leader).shard_status(shard).await?.term;

    cluster.network.isolate(old_leader);
    let new_leaders = cluster.wait_for_leaders(&survivors).await?;
    assert_ne!(new_leaders[&shard], old_leader);

    let survivor = cluster.node(survivors[0]);
    wait_for_value(survivor, "before", Some(b"1")).await?;
    survivor.put("after", "2").await?;
    let new_term = survivor.shard_status(shard).await?.term;
    assert!(new_term > old_term);

    // Once it hears from the cluster again the old leader follows the new
    // term and catches up on what it missed.
    cluster.network.restore(old_leader);
    let start = Instant::now();
    loop {
        let status = cluster.node(old_leader).shard_status(shard).await?;
        if matches!(status.role, ShardRole::Follower { term, .. } if term >= new_term) {
            break;
        }
        if start.elapsed() > SETTLE {
            bail!("old leader never stepped down: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    wait_for_value(cluster.node(old_leader), "after", Some(b"2")).await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shards_below_quorum_refuse_writes_but_serve_reads() -> Result<()> {
    let cluster = TestCluster::spawn(3, 3).await?;
    cluster.wait_for_leaders(&[1, 2, 3]).await?;
    cluster.node(1).put("kept", "v1").await?;
    wait_for_value(cluster.node(1), "kept", Some(b"v1")).await?;

    for id in [2, 3] {
        cluster.node(id).shutdown();
        cluster.network.isolate(id);
    }
    let start = Instant::now();
    while cluster.node(1).ring().node_count() > 1 {
        if start.elapsed() > SETTLE {
            bail!("dead peers were never removed from the ring");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let err = cluster.node(1).put("refused", "x").await.unwrap_err();
    assert!(
        matches!(err, KvError::QuorumUnavailable { alive: 1, quorum: 2, .. }),
        "unexpected {err:?}"
    );
    assert_eq!(cluster.node(1).get("kept").await?, b"v1".to_vec());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_from_a_stale_term_is_rejected() -> Result<()> {
    let cluster = TestCluster::spawn(3, 3).await?;
    let leaders = cluster.wait_for_leaders(&[1, 2, 3]).await?;
    let leader = leaders[&0];
    let follower = (1..=3).find(|&id| id != leader).unwrap_or(1);

    let outsider = cluster.network.transport(99);
    let response = outsider
        .call(
            follower,
            Envelope {
                from: 99,
                request: Request::ReplicateEntry {
                    shard_id: 0,
                    term: 0,
                    sequence: 1,
                    prev_term: None,
                    key: "rogue".to_string(),
                    value: b"x".to_vec(),
                    tombstone: false,
                },
            },
        )
        .await?;
    assert!(
        matches!(
            response,
            Response::Reject {
                reason: RejectReason::StaleTerm { current }
            } if current >= 1
        ),
        "unexpected {response:?}"
    );
    assert!(matches!(
        cluster.node(follower).get("rogue").await,
        Err(KvError::NotFound)
    ));

    cluster.shutdown().await;
    Ok(())
}
