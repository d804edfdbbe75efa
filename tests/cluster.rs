//! Integration tests for a real three-node cluster with TCP transport:
//! replication to every follower, leader failover, and writes on the new
//! leader.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use quotient::config::{PeerAddress, RaftSettings};
use quotient::filter::QuotientFilter;
use quotient::raft::{self, ApplyOutcome, FilterFsm, NodeHandle, RaftCommand, RaftError};

const HEARTBEAT_MS: u64 = 150;

fn election_timeout() -> Duration {
    Duration::from_millis(2 * HEARTBEAT_MS)
}

struct ClusterNode {
    id: u64,
    addr: String,
    filter: Arc<QuotientFilter>,
    handle: NodeHandle,
    alive: bool,
    _dirs: (TempDir, TempDir),
}

struct TestCluster {
    nodes: Vec<ClusterNode>,
}

fn free_addr() -> String {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);
    addr
}

impl TestCluster {
    fn spawn(n: usize) -> Self {
        let addrs: Vec<String> = (0..n).map(|_| free_addr()).collect();
        let peers: Vec<PeerAddress> = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| PeerAddress {
                id: i as u64 + 1,
                raft_addr: addr.clone(),
                http_addr: addr.clone(),
            })
            .collect();

        let nodes = (0..n)
            .map(|i| {
                let id = i as u64 + 1;
                let log_dir = TempDir::new().unwrap();
                let snapshot_dir = TempDir::new().unwrap();
                let settings = RaftSettings {
                    node_id: id,
                    tcp_address: addrs[i].clone(),
                    timeout_ms: HEARTBEAT_MS,
                    log_dir: log_dir.path().to_string_lossy().into_owned(),
                    snapshot_dir: snapshot_dir.path().to_string_lossy().into_owned(),
                    peer_addresses: peers.clone(),
                };

                let filter = Arc::new(QuotientFilter::new(22).unwrap());
                let fsm = Box::new(FilterFsm::new(Arc::clone(&filter)));
                let handle = raft::spawn(&settings, fsm).unwrap();
                ClusterNode {
                    id,
                    addr: addrs[i].clone(),
                    filter,
                    handle,
                    alive: true,
                    _dirs: (log_dir, snapshot_dir),
                }
            })
            .collect();

        Self { nodes }
    }

    fn node(&self, id: u64) -> &ClusterNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    fn kill(&mut self, id: u64) {
        let node = self.nodes.iter_mut().find(|n| n.id == id).unwrap();
        node.handle.shutdown();
        node.alive = false;
    }

    async fn wait_for_leader(&self, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        loop {
            for node in self.nodes.iter().filter(|n| n.alive) {
                if let Ok(status) = node.handle.status().await {
                    if status.is_leader {
                        return node.id;
                    }
                }
            }
            assert!(
                Instant::now() < deadline,
                "no leader elected within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Proposes on the given node, retrying while the cluster settles on a
    /// leader.
    async fn propose(&self, id: u64, command: RaftCommand) -> ApplyOutcome {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match self.node(id).handle.propose(command.clone()).await {
                Ok(outcome) => return outcome,
                Err(RaftError::NoLeader | RaftError::NotLeader { .. })
                    if Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("propose failed: {e}"),
            }
        }
    }

    /// Polls until the key is visible on the node's local filter.
    async fn assert_exists(&self, id: u64, key: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.node(id).filter.exists(key).0 {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "node {id} never saw key {:?}",
                String::from_utf8_lossy(key)
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[tokio::test]
async fn replication_and_leader_failover() {
    let mut cluster = TestCluster::spawn(3);

    // Nudge node 1 so the first election settles quickly.
    cluster.node(1).handle.campaign();
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;

    // A committed insert must be visible on every replica's local filter.
    let outcome = cluster.propose(leader, RaftCommand::insert("a")).await;
    assert_eq!(outcome, ApplyOutcome::Inserted);
    for node in &cluster.nodes {
        cluster.assert_exists(node.id, b"a").await;
    }

    // Kill the leader; a follower takes over within the election bound.
    cluster.kill(leader);
    let successor = cluster.nodes.iter().find(|n| n.alive).unwrap().id;
    cluster.node(successor).handle.campaign();
    let failover_started = Instant::now();
    let new_leader = cluster.wait_for_leader(2 * election_timeout()).await;
    assert_ne!(new_leader, leader);
    assert!(
        failover_started.elapsed() <= 2 * election_timeout(),
        "failover took {:?}",
        failover_started.elapsed()
    );

    // The new leader accepts writes, and both keys live on all survivors.
    let outcome = cluster.propose(new_leader, RaftCommand::insert("b")).await;
    assert_eq!(outcome, ApplyOutcome::Inserted);
    for node in cluster.nodes.iter().filter(|n| n.alive) {
        cluster.assert_exists(node.id, b"a").await;
        cluster.assert_exists(node.id, b"b").await;
    }

    for node in cluster.nodes.iter().filter(|n| n.alive) {
        node.handle.shutdown();
    }
}

#[tokio::test]
async fn followers_point_at_the_leader() {
    let cluster = TestCluster::spawn(3);
    cluster.node(1).handle.campaign();
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;

    for node in cluster.nodes.iter().filter(|n| n.id != leader) {
        // Followers learn the leader from its first heartbeat; poll until
        // the hint is populated.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match node.handle.propose(RaftCommand::insert("x")).await {
                Err(RaftError::NotLeader { leader_http }) => {
                    assert_eq!(
                        leader_http.as_deref(),
                        Some(cluster.node(leader).addr.as_str())
                    );
                    break;
                }
                Err(RaftError::NoLeader) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                other => panic!("follower {} gave unexpected result: {other:?}", node.id),
            }
        }
    }

    for node in &cluster.nodes {
        node.handle.shutdown();
    }
}

#[tokio::test]
async fn duplicate_inserts_replicate_idempotently() {
    let cluster = TestCluster::spawn(3);
    cluster.node(1).handle.campaign();
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;

    assert_eq!(
        cluster.propose(leader, RaftCommand::insert("dup")).await,
        ApplyOutcome::Inserted
    );
    assert_eq!(
        cluster.propose(leader, RaftCommand::insert("dup")).await,
        ApplyOutcome::AlreadyPresent
    );
    assert_eq!(
        cluster.propose(leader, RaftCommand::remove("dup")).await,
        ApplyOutcome::Removed
    );

    // Every replica converges to the same count.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cluster.nodes.iter().all(|n| n.filter.count() == 0) {
            break;
        }
        assert!(Instant::now() < deadline, "replicas did not converge");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in &cluster.nodes {
        node.handle.shutdown();
    }
}
