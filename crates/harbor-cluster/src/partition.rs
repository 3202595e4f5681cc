//! Slot partitioning and replica assignment.
//!
//! The controller splits the keyspace into one contiguous range per node,
//! ascending by node id, and picks a random different node to back up each
//! range. The resulting tables are computed once per cluster formation and
//! then distributed as facts.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::slots::{SlotRange, FIRST_SLOT, SLOT_COUNT};
use crate::NodeId;

/// Node id → the primary ranges it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotAssignmentTable(pub BTreeMap<NodeId, Vec<SlotRange>>);

/// Node id → the ranges it backs up for other owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaAssignmentTable(pub BTreeMap<NodeId, Vec<SlotRange>>);

/// Owner node id → the node backing up its primaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaNodeIndex(pub BTreeMap<NodeId, NodeId>);

impl SlotAssignmentTable {
    /// Ranges owned by `node`, empty if it has none.
    pub fn ranges_for(&self, node: NodeId) -> Vec<SlotRange> {
        self.0.get(&node).cloned().unwrap_or_default()
    }

    /// All nodes holding slots.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.0.keys().copied().collect()
    }

    /// Returns the owner of `slot`, if assigned.
    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.0
            .iter()
            .find(|(_, ranges)| ranges.iter().any(|r| r.contains(slot)))
            .map(|(node, _)| *node)
    }

    /// Returns true if the ranges cover every slot exactly once.
    pub fn is_complete(&self) -> bool {
        let mut all: Vec<SlotRange> = self.0.values().flatten().copied().collect();
        all.sort();
        let mut next = FIRST_SLOT;
        for range in all {
            if range.start != next {
                return false;
            }
            next = range.end.saturating_add(1);
        }
        next == SLOT_COUNT + 1
    }
}

impl ReplicaAssignmentTable {
    /// Ranges `node` backs up, empty if none.
    pub fn ranges_for(&self, node: NodeId) -> Vec<SlotRange> {
        self.0.get(&node).cloned().unwrap_or_default()
    }
}

impl ReplicaNodeIndex {
    /// The node backing up `owner`.
    pub fn holder_of(&self, owner: NodeId) -> Option<NodeId> {
        self.0.get(&owner).copied()
    }
}

/// The complete output of one partitioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTables {
    pub slots: SlotAssignmentTable,
    pub replicas: ReplicaAssignmentTable,
    pub replica_nodes: ReplicaNodeIndex,
}

/// What one node needs to know about its own share of the keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSlice {
    pub slots: Vec<SlotRange>,
    pub replicas: Vec<SlotRange>,
    pub replica_node: Option<NodeId>,
}

impl SlotTables {
    /// Runs a full partitioning pass for `controller` and its peers.
    pub fn compute<R: Rng + ?Sized>(
        controller: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        rng: &mut R,
    ) -> Self {
        let slots = split_slots(controller, peers);
        let (replicas, replica_nodes) = assign_replicas(&slots, rng);
        Self {
            slots,
            replicas,
            replica_nodes,
        }
    }

    /// Extracts the share of `node`.
    pub fn slice_for(&self, node: NodeId) -> NodeSlice {
        NodeSlice {
            slots: self.slots.ranges_for(node),
            replicas: self.replicas.ranges_for(node),
            replica_node: self.replica_nodes.holder_of(node),
        }
    }

    /// All nodes that own slots.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.slots.nodes()
    }
}

/// Splits the keyspace into one contiguous range per node.
///
/// Nodes are ordered by id and receive ascending ranges of
/// `16384 / N` slots; the remainder is added to the controller's range.
pub fn split_slots(
    controller: NodeId,
    peers: impl IntoIterator<Item = NodeId>,
) -> SlotAssignmentTable {
    let mut nodes: BTreeSet<NodeId> = peers.into_iter().collect();
    nodes.insert(controller);

    let count = nodes.len() as u16;
    let base = SLOT_COUNT / count;
    let remainder = SLOT_COUNT % count;

    let mut table = BTreeMap::new();
    let mut start = FIRST_SLOT;
    for node in nodes {
        let len = if node == controller { base + remainder } else { base };
        let end = start + len - 1;
        table.insert(node, vec![SlotRange::new(start, end)]);
        start = end + 1;
    }
    SlotAssignmentTable(table)
}

/// Picks a backing node for every owner in `slots`.
///
/// Each owner gets a uniformly random node id other than its own; there is
/// no attempt to balance replicas across holders. An owner with no other
/// node to pick from gets no replica.
pub fn assign_replicas<R: Rng + ?Sized>(
    slots: &SlotAssignmentTable,
    rng: &mut R,
) -> (ReplicaAssignmentTable, ReplicaNodeIndex) {
    let nodes: Vec<NodeId> = slots.0.keys().copied().collect();
    let mut replicas: BTreeMap<NodeId, Vec<SlotRange>> = BTreeMap::new();
    let mut index = BTreeMap::new();

    if nodes.len() < 2 {
        return (ReplicaAssignmentTable(replicas), ReplicaNodeIndex(index));
    }

    for (&owner, ranges) in &slots.0 {
        let holder = loop {
            match nodes.choose(rng) {
                Some(&candidate) if candidate != owner => break candidate,
                _ => continue,
            }
        };
        replicas.entry(holder).or_default().extend(ranges.iter().copied());
        index.insert(owner, holder);
    }

    for ranges in replicas.values_mut() {
        ranges.sort();
    }

    (ReplicaAssignmentTable(replicas), ReplicaNodeIndex(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peers(n: i32) -> Vec<NodeId> {
        (2..=n).map(NodeId).collect()
    }

    #[test]
    fn single_node_owns_everything() {
        let table = split_slots(NodeId(1), []);
        assert_eq!(table.ranges_for(NodeId(1)), vec![SlotRange::full()]);
        assert!(table.is_complete());
    }

    #[test]
    fn three_nodes_remainder_goes_to_controller() {
        // 16384 = 3 * 5461 + 1
        let table = split_slots(NodeId(3), [NodeId(1), NodeId(2)]);
        assert_eq!(table.0.len(), 3);
        assert_eq!(table.ranges_for(NodeId(1)), vec![SlotRange::new(1, 5461)]);
        assert_eq!(table.ranges_for(NodeId(2)), vec![SlotRange::new(5462, 10922)]);
        assert_eq!(table.ranges_for(NodeId(3)), vec![SlotRange::new(10923, 16384)]);
        assert_eq!(table.ranges_for(NodeId(3))[0].len(), 5461 + 16384 % 3);
    }

    #[test]
    fn controller_in_the_middle_shifts_later_ranges() {
        let table = split_slots(NodeId(2), [NodeId(1), NodeId(3)]);
        assert_eq!(table.ranges_for(NodeId(1)), vec![SlotRange::new(1, 5461)]);
        assert_eq!(table.ranges_for(NodeId(2)), vec![SlotRange::new(5462, 10923)]);
        assert_eq!(table.ranges_for(NodeId(3)), vec![SlotRange::new(10924, 16384)]);
    }

    #[test]
    fn coverage_for_one_to_sixteen_nodes() {
        for n in 1..=16 {
            let table = split_slots(NodeId(1), peers(n));
            assert_eq!(table.0.len(), n as usize);
            assert!(table.is_complete(), "gap or overlap with {n} nodes");

            let mut seen = vec![false; SLOT_COUNT as usize + 1];
            for range in table.0.values().flatten() {
                for slot in range.iter() {
                    assert!(!seen[slot as usize], "slot {slot} assigned twice");
                    seen[slot as usize] = true;
                }
            }
            assert!(!seen[0], "slot 0 must never be assigned");
            assert!(seen[1..].iter().all(|s| *s));
        }
    }

    #[test]
    fn incomplete_table_detected() {
        let mut table = split_slots(NodeId(1), peers(3));
        table.0.remove(&NodeId(2));
        assert!(!table.is_complete());
    }

    #[test]
    fn owner_lookup() {
        let table = split_slots(NodeId(1), peers(2));
        assert_eq!(table.owner(1), Some(NodeId(1)));
        assert_eq!(table.owner(16384), Some(NodeId(2)));
        assert_eq!(table.owner(0), None);
    }

    #[test]
    fn replicas_never_back_up_themselves() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            for n in 2..=16 {
                let tables = SlotTables::compute(NodeId(1), peers(n), &mut rng);
                for (owner, holder) in &tables.replica_nodes.0 {
                    assert_ne!(owner, holder);
                }
                assert_eq!(tables.replica_nodes.0.len(), n as usize);
                for (holder, replica_ranges) in &tables.replicas.0 {
                    let own = tables.slots.ranges_for(*holder);
                    for r in replica_ranges {
                        assert!(own.iter().all(|p| !p.overlaps(r)));
                    }
                }
            }
        }
    }

    #[test]
    fn each_range_replicated_exactly_once() {
        let mut rng = StdRng::seed_from_u64(42);
        let tables = SlotTables::compute(NodeId(5), peers(6), &mut rng);
        let mut replicated: Vec<SlotRange> = tables.replicas.0.values().flatten().copied().collect();
        replicated.sort();
        let mut primaries: Vec<SlotRange> = tables.slots.0.values().flatten().copied().collect();
        primaries.sort();
        assert_eq!(replicated, primaries);

        // the index agrees with the replica table
        for (owner, holder) in &tables.replica_nodes.0 {
            let held = tables.replicas.ranges_for(*holder);
            for range in tables.slots.ranges_for(*owner) {
                assert!(held.contains(&range));
            }
        }
    }

    #[test]
    fn single_node_has_no_replicas() {
        let mut rng = StdRng::seed_from_u64(1);
        let tables = SlotTables::compute(NodeId(1), [], &mut rng);
        assert!(tables.replicas.0.is_empty());
        assert!(tables.replica_nodes.0.is_empty());
    }

    #[test]
    fn slice_for_node() {
        let mut rng = StdRng::seed_from_u64(3);
        let tables = SlotTables::compute(NodeId(1), peers(2), &mut rng);
        // with two nodes each must back up the other
        let slice = tables.slice_for(NodeId(1));
        assert_eq!(slice.slots, vec![SlotRange::new(1, 8192)]);
        assert_eq!(slice.replicas, vec![SlotRange::new(8193, 16384)]);
        assert_eq!(slice.replica_node, Some(NodeId(2)));

        let stranger = tables.slice_for(NodeId(9));
        assert_eq!(stranger, NodeSlice::default());
    }
}
