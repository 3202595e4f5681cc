//! Restarting nodes from their assignment logs.

use std::sync::Arc;
use std::time::Duration;

use harbor_cluster::{ClusterError, LifecycleState, NodeId};
use harbor_persistence::{AssignmentFile, AssignmentLog};

use crate::helpers::{
    bind, candidate, form_cluster, form_cluster_in, node_config, plain, shutdown_all,
    FORMATION_TIMEOUT,
};

#[tokio::test]
async fn formation_writes_every_assignment_file() {
    let nodes = form_cluster(&[candidate(1), candidate(2), plain(3)]).await;

    for n in &nodes[..2] {
        let log = AssignmentLog::open(n.dir.path()).unwrap();
        for file in AssignmentFile::ALL {
            assert!(log.read(file).unwrap().is_some(), "{file:?} missing");
        }
    }

    // a plain node keeps only its own slice
    let log = AssignmentLog::open(nodes[2].dir.path()).unwrap();
    assert!(log.read(AssignmentFile::SlotsAllocation).unwrap().is_none());
    assert!(log.read(AssignmentFile::NodeSlots).unwrap().is_some());
    assert!(log.read(AssignmentFile::NodeSlotsReplicas).unwrap().is_some());

    shutdown_all(&nodes);
}

#[tokio::test]
async fn plain_node_resumes_without_peers() {
    let mut nodes = form_cluster(&[candidate(1), candidate(2), plain(3)]).await;
    let old = nodes.pop().unwrap();
    let ranges = old.node.store().owned_ranges();
    let holder = old.node.store().replica_node();
    old.node.shutdown();

    // no seeds and nobody to wait for: the slice comes from disk
    let restarted = bind(node_config(plain(3), vec![], 0, old.dir.path())).await;
    tokio::time::timeout(Duration::from_secs(2), restarted.start())
        .await
        .expect("resumed without waiting")
        .unwrap();

    assert_eq!(restarted.state(), LifecycleState::Started);
    assert_eq!(restarted.store().owned_ranges(), ranges);
    assert_eq!(restarted.store().replica_node(), holder);

    restarted.shutdown();
    shutdown_all(&nodes);
}

#[tokio::test]
async fn restarted_cluster_reuses_persisted_tables() {
    let members = [candidate(1), candidate(2), candidate(3)];
    let nodes = form_cluster(&members).await;
    let tables = nodes[0].node.tables().unwrap();
    shutdown_all(&nodes);

    let dirs = nodes.into_iter().map(|n| n.dir).collect();
    let nodes = form_cluster_in(&members, dirs).await;

    // replica holders are drawn at random; matching tables were reloaded
    for n in &nodes {
        assert_eq!(n.node.tables().as_ref(), Some(&tables));
        assert_eq!(
            n.node.store().owned_ranges(),
            tables.slots.ranges_for(n.id())
        );
    }
    assert!(nodes.iter().any(|n| n.node.controller() == Some(n.id())));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn unwritable_tables_fail_the_controller_before_broadcast() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    // node 2 wins the two-way tie; a directory in its temp file's place
    // makes the first table write fail
    std::fs::create_dir(dir2.path().join("slots_allocation.tmp")).unwrap();

    let node1 = bind(node_config(candidate(1), vec![], 1, dir1.path())).await;
    let node2 = bind(node_config(
        candidate(2),
        vec![node1.peer_addr()],
        1,
        dir2.path(),
    ))
    .await;

    let start1 = tokio::spawn({
        let node = Arc::clone(&node1);
        async move { node.start().await }
    });
    let start2 = tokio::spawn({
        let node = Arc::clone(&node2);
        async move { node.start().await }
    });

    let result = tokio::time::timeout(FORMATION_TIMEOUT, start2)
        .await
        .expect("controller startup finished")
        .unwrap();
    assert!(matches!(result, Err(ClusterError::Persistence(_))));
    assert_eq!(node2.state(), LifecycleState::Failed);
    assert!(node2.tables().is_none());
    assert_eq!(node2.store().slot_count(), 0);

    // the other candidate never hears about any tables
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!start1.is_finished());
    assert_eq!(node1.state(), LifecycleState::Initialized);
    assert_eq!(node1.controller(), Some(NodeId(2)));
    assert!(node1.tables().is_none());
    assert_eq!(node1.store().slot_count(), 0);

    let log = AssignmentLog::open(dir1.path()).unwrap();
    assert!(log.read(AssignmentFile::SlotsAllocation).unwrap().is_none());

    node1.shutdown();
    node2.shutdown();
}
