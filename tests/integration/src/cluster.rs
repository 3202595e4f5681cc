//! Cluster formation, election and slot movement between live nodes.

use std::collections::BTreeSet;
use std::time::Duration;

use harbor_cluster::{
    AssignmentStore, ClusterError, LifecycleState, NodeId, NodeRole, OpaqueSlot, SlotRange,
    SLOT_COUNT,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::helpers::{
    bind, candidate, eventually, form_cluster, node_config, plain, shutdown_all, TestNode,
    FORMATION_TIMEOUT,
};

fn controller_of(nodes: &[TestNode]) -> &TestNode {
    let id = nodes[0].node.controller().expect("controller known");
    nodes
        .iter()
        .find(|n| n.id() == id)
        .expect("controller is a member")
}

fn node_by_id(nodes: &[TestNode], id: NodeId) -> &TestNode {
    nodes.iter().find(|n| n.id() == id).expect("member exists")
}

#[tokio::test]
async fn three_candidates_agree_on_one_controller() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;

    let controller = nodes[0].node.controller().unwrap();
    for n in &nodes {
        assert_eq!(n.node.controller(), Some(controller));
    }
    let controllers: Vec<_> = nodes
        .iter()
        .filter(|n| n.node.role() == NodeRole::Controller)
        .collect();
    assert_eq!(controllers.len(), 1);
    assert_eq!(controllers[0].id(), controller);

    // every candidate holds the same complete tables
    let tables = controller_of(&nodes).node.tables().unwrap();
    assert!(tables.slots.is_complete());
    assert_eq!(tables.slots.0.len(), 3);
    for n in &nodes {
        assert_eq!(n.node.tables().as_ref(), Some(&tables));
    }

    // the controller's range absorbs the remainder
    let share = (SLOT_COUNT / 3) as usize;
    for n in &nodes {
        let expected = if n.id() == controller {
            share + (SLOT_COUNT % 3) as usize
        } else {
            share
        };
        assert_eq!(n.node.store().slot_count(), expected);
    }

    shutdown_all(&nodes);
}

#[tokio::test]
async fn slots_are_split_without_gaps_or_overlap() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;

    let mut seen = BTreeSet::new();
    let mut total = 0;
    for n in &nodes {
        let store = n.node.store();
        assert!(store.slot_count() > 0);
        total += store.slot_count();
        for range in store.owned_ranges() {
            for slot in range.iter() {
                assert!(seen.insert(slot), "slot {slot} owned twice");
            }
        }
    }
    assert_eq!(total, SLOT_COUNT as usize);
    assert_eq!(seen.len(), SLOT_COUNT as usize);

    // the local store matches what the tables say
    let tables = controller_of(&nodes).node.tables().unwrap();
    for n in &nodes {
        assert_eq!(n.node.store().owned_ranges(), tables.slots.ranges_for(n.id()));
    }

    shutdown_all(&nodes);
}

#[tokio::test]
async fn replicas_are_held_by_another_node() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;
    let tables = controller_of(&nodes).node.tables().unwrap();

    for n in &nodes {
        let holder = n.node.store().replica_node().expect("replica node assigned");
        assert_ne!(holder, n.id());
        assert_eq!(tables.replica_nodes.holder_of(n.id()), Some(holder));

        // the holder keeps a replica of exactly this node's ranges
        let held = node_by_id(&nodes, holder).node.store().replica_ranges();
        for range in n.node.store().owned_ranges() {
            assert!(held.contains(&range), "{range} not replicated on {holder}");
        }
    }

    shutdown_all(&nodes);
}

#[tokio::test]
async fn plain_node_receives_its_slice() {
    let nodes = form_cluster(&[candidate(1), candidate(2), plain(3)]).await;
    let plain_node = &nodes[2];

    let controller = plain_node.node.controller().expect("controller announced");
    assert!(controller == NodeId(1) || controller == NodeId(2));
    assert_eq!(plain_node.node.role(), NodeRole::Node);
    assert!(plain_node.node.tables().is_none());

    let tables = node_by_id(&nodes, controller).node.tables().unwrap();
    assert_eq!(
        plain_node.node.store().owned_ranges(),
        tables.slots.ranges_for(NodeId(3))
    );
    assert_eq!(
        plain_node.node.store().replica_node(),
        tables.replica_nodes.holder_of(NodeId(3))
    );

    shutdown_all(&nodes);
}

#[tokio::test]
async fn late_candidate_fetches_tables_from_controller() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;
    let controller = controller_of(&nodes);
    let tables = controller.node.tables().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let seeds = nodes.iter().map(|n| n.node.peer_addr()).collect();
    let late = bind(node_config(candidate(4), seeds, 3, dir.path())).await;
    tokio::time::timeout(FORMATION_TIMEOUT, late.start())
        .await
        .expect("late node started in time")
        .unwrap();

    assert_eq!(late.state(), LifecycleState::Started);
    assert_eq!(late.controller(), Some(controller.id()));
    assert_eq!(late.role(), NodeRole::ControllerCandidate);
    assert_eq!(late.tables(), Some(tables));
    // the keyspace was split before it joined
    assert_eq!(late.store().slot_count(), 0);

    late.shutdown();
    shutdown_all(&nodes);
}

#[tokio::test]
async fn election_waits_for_a_silent_candidate() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    // bound but never started: it completes handshakes but never votes
    let silent = bind(node_config(candidate(1), vec![], 1, dir1.path())).await;
    let waiting = bind(node_config(
        candidate(2),
        vec![silent.peer_addr()],
        1,
        dir2.path(),
    ))
    .await;

    let stalled = tokio::time::timeout(Duration::from_millis(500), waiting.start()).await;
    assert!(stalled.is_err(), "election finished without a quorum");
    assert_eq!(waiting.state(), LifecycleState::Initialized);
    assert!(waiting.controller().is_none());
    assert_eq!(waiting.store().slot_count(), 0);

    waiting.shutdown();
    silent.shutdown();
}

#[tokio::test]
async fn garbage_seed_handshake_fails_startup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed = listener.local_addr().unwrap();
    let impostor = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // node id 9, candidate, then a negative ip length
        stream
            .write_all(&[0, 0, 0, 9, 1, 0xff, 0xff, 0xff, 0xff])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let dir = tempfile::tempdir().unwrap();
    let node = bind(node_config(candidate(1), vec![seed], 0, dir.path())).await;
    let result = tokio::time::timeout(FORMATION_TIMEOUT, node.start())
        .await
        .expect("startup finished");

    assert!(matches!(result, Err(ClusterError::Handshake { .. })));
    assert_eq!(node.state(), LifecycleState::Failed);
    assert!(node.controller().is_none());
    assert!(node.directory().is_empty());

    node.shutdown();
    impostor.abort();
}

#[tokio::test]
async fn server_addresses_are_ordered_by_node_id() {
    let nodes = form_cluster(&[candidate(1), candidate(2), plain(3)]).await;

    for n in &nodes {
        let ports: Vec<u16> = n.node.server_addresses().iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![9001, 9002, 9003]);
    }

    shutdown_all(&nodes);
}

#[tokio::test]
async fn transfer_moves_data_and_ownership() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;
    let tables = controller_of(&nodes).node.tables().unwrap();

    let owner = node_by_id(&nodes, tables.slots.owner(10).unwrap());
    let target = nodes.iter().find(|n| n.id() != owner.id()).unwrap();

    for slot in 10..=15u16 {
        owner
            .node
            .store()
            .put_slot(slot, OpaqueSlot::new(format!("payload-{slot}")));
    }

    let report = owner
        .node
        .transfer_slots(target.id(), SlotRange::new(10, 20))
        .unwrap();
    assert_eq!(report.sent, 6);
    assert_eq!(report.dropped_empty, 5);
    assert!(report.failed.is_empty());

    // the range left the owner, its neighbours stayed
    let store = owner.node.store();
    assert!(store.owns(9));
    assert!(store.owns(21));
    for slot in 10..=20 {
        assert!(!store.owns(slot));
    }

    eventually(Duration::from_secs(5), "slot data on target", || {
        (10..=15u16).all(|slot| target.node.store().owns(slot))
    })
    .await;
    assert_eq!(
        target.node.store().get_slot_data(12).unwrap().as_ref(),
        b"payload-12"
    );
    // empty slots are not sent
    assert!(!target.node.store().owns(16));

    // the shrunk ranges are on disk
    let persisted = AssignmentStore::open(owner.dir.path())
        .unwrap()
        .load_slice(owner.id())
        .unwrap()
        .unwrap();
    assert!(persisted.slots.iter().all(|r| !r.contains(10)));
    assert!(persisted.slots.iter().any(|r| r.contains(9)));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn transfer_to_unknown_node_keeps_data() {
    let nodes = form_cluster(&[candidate(1), candidate(2)]).await;
    let tables = controller_of(&nodes).node.tables().unwrap();
    let owner = node_by_id(&nodes, tables.slots.owner(100).unwrap());

    owner.node.store().put_slot(100, OpaqueSlot::new(b"keep"));
    let err = owner
        .node
        .transfer_slots(NodeId(42), SlotRange::new(100, 100))
        .unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(NodeId(42))));
    assert_eq!(
        owner.node.store().get_slot_data(100).unwrap().as_ref(),
        b"keep"
    );

    shutdown_all(&nodes);
}

#[tokio::test]
async fn transfer_can_be_requested_by_a_third_node() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;
    let tables = controller_of(&nodes).node.tables().unwrap();

    let owner = node_by_id(&nodes, tables.slots.owner(500).unwrap());
    let others: Vec<&TestNode> = nodes.iter().filter(|n| n.id() != owner.id()).collect();
    let (requester, target) = (others[0], others[1]);

    owner.node.store().put_slot(500, OpaqueSlot::new(b"moved"));
    assert!(requester
        .node
        .request_transfer(owner.id(), target.id(), SlotRange::new(500, 501)));

    eventually(Duration::from_secs(5), "requested transfer", || {
        target.node.store().owns(500) && !owner.node.store().owns(500)
    })
    .await;
    assert_eq!(
        target.node.store().get_slot_data(500).unwrap().as_ref(),
        b"moved"
    );
    // slot 501 was empty and dropped
    assert!(!owner.node.store().owns(501));
    assert!(!target.node.store().owns(501));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn node_slots_and_replica_node_can_be_replaced() {
    let nodes = form_cluster(&[candidate(1), candidate(2), plain(3)]).await;
    let sender = &nodes[0];
    let target = &nodes[2];

    let ranges = vec![SlotRange::new(1, 10), SlotRange::new(20, 30)];
    assert!(sender.node.update_node_slots(target.id(), ranges.clone()));
    eventually(Duration::from_secs(5), "new primary ranges", || {
        target.node.store().owned_ranges() == ranges
    })
    .await;

    assert!(sender.node.update_replica_node(target.id(), NodeId(1)));
    eventually(Duration::from_secs(5), "new replica node", || {
        target.node.store().replica_node() == Some(NodeId(1))
    })
    .await;

    let persisted = AssignmentStore::open(target.dir.path())
        .unwrap()
        .load_slice(target.id())
        .unwrap()
        .unwrap();
    assert_eq!(persisted.slots, ranges);
    assert_eq!(persisted.replica_node, Some(NodeId(1)));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn shutdown_drops_the_node_from_its_peers() {
    let nodes = form_cluster(&[candidate(1), candidate(2), candidate(3)]).await;
    let leaving = &nodes[2];

    leaving.node.shutdown();
    assert_eq!(leaving.node.state(), LifecycleState::Shutdown);
    assert!(leaving.node.directory().is_empty());

    eventually(Duration::from_secs(5), "peers to notice the shutdown", || {
        nodes[..2]
            .iter()
            .all(|n| !n.node.directory().contains(leaving.id()))
    })
    .await;

    // a second shutdown is a no-op
    leaving.node.shutdown();
    shutdown_all(&nodes[..2]);
}
