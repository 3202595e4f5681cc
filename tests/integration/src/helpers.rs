//! Test helpers for running in-process harbor nodes on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use harbor_cluster::{LifecycleState, Node, NodeConfig, NodeId, OpaqueSlot};

/// How long a cluster gets to form before a test gives up.
pub const FORMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A node plus the directory holding its assignment log.
pub struct TestNode {
    pub node: Arc<Node<OpaqueSlot>>,
    pub dir: tempfile::TempDir,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// Options for one member of a test cluster.
#[derive(Clone, Copy)]
pub struct Member {
    pub id: i32,
    pub candidate: bool,
}

pub fn candidate(id: i32) -> Member {
    Member {
        id,
        candidate: true,
    }
}

pub fn plain(id: i32) -> Member {
    Member {
        id,
        candidate: false,
    }
}

/// Config for a loopback node with fast retry sweeps.
pub fn node_config(
    member: Member,
    seeds: Vec<SocketAddr>,
    expected_peers: usize,
    data_dir: &Path,
) -> NodeConfig {
    NodeConfig {
        node_id: NodeId(member.id),
        controller_candidate: member.candidate,
        advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        client_port: 9000 + member.id as u16,
        seeds,
        expected_peers,
        data_dir: data_dir.to_path_buf(),
        dial_attempts: 3,
        reconnect_interval: Duration::from_millis(100),
        housekeeping_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Binds a node without starting it.
pub async fn bind(config: NodeConfig) -> Arc<Node<OpaqueSlot>> {
    Node::<OpaqueSlot>::bind(config)
        .await
        .unwrap_or_else(|e| panic!("failed to bind node: {e}"))
}

/// Binds every member, each seeded with the members bound before it, then
/// starts them all at once and waits for every start to finish.
pub async fn form_cluster(members: &[Member]) -> Vec<TestNode> {
    let dirs = members
        .iter()
        .map(|_| tempfile::tempdir().unwrap())
        .collect();
    form_cluster_in(members, dirs).await
}

/// Like [`form_cluster`], with each member reusing the given data dir.
pub async fn form_cluster_in(members: &[Member], dirs: Vec<tempfile::TempDir>) -> Vec<TestNode> {
    assert_eq!(members.len(), dirs.len());
    let expected = members.len() - 1;
    let mut nodes: Vec<TestNode> = Vec::with_capacity(members.len());
    for (member, dir) in members.iter().zip(dirs) {
        let seeds = nodes.iter().map(|n| n.node.peer_addr()).collect();
        let node = bind(node_config(*member, seeds, expected, dir.path())).await;
        nodes.push(TestNode { node, dir });
    }

    let starts: Vec<_> = nodes
        .iter()
        .map(|n| {
            let node = Arc::clone(&n.node);
            tokio::spawn(async move { node.start().await })
        })
        .collect();
    for (i, start) in starts.into_iter().enumerate() {
        match tokio::time::timeout(FORMATION_TIMEOUT, start).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => panic!("node {} failed to start: {e}", members[i].id),
            Ok(Err(e)) => panic!("start task of node {} panicked: {e}", members[i].id),
            Err(_) => panic!("node {} did not start in time", members[i].id),
        }
    }
    for n in &nodes {
        assert_eq!(n.node.state(), LifecycleState::Started);
    }
    nodes
}

/// Polls `check` until it holds, panicking after `timeout`.
pub async fn eventually(timeout: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn shutdown_all(nodes: &[TestNode]) {
    for n in nodes {
        n.node.shutdown();
    }
}
