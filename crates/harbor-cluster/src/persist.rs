//! Typed access to the assignment log.
//!
//! Tables and slices are stored as JSON payloads inside the checksummed
//! files of [`AssignmentLog`], one file per table.

use std::path::Path;

use harbor_persistence::{AssignmentFile, AssignmentLog};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::partition::{
    NodeSlice, ReplicaAssignmentTable, ReplicaNodeIndex, SlotAssignmentTable, SlotTables,
};
use crate::slots::SlotRange;
use crate::{ClusterError, NodeId};

/// Reads and writes this node's persisted assignments.
#[derive(Debug, Clone)]
pub struct AssignmentStore {
    log: AssignmentLog,
}

impl AssignmentStore {
    /// Opens (creating if needed) the log directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ClusterError> {
        Ok(Self {
            log: AssignmentLog::open(dir.as_ref())?,
        })
    }

    fn save<T: Serialize>(&self, file: AssignmentFile, value: &T) -> Result<(), ClusterError> {
        let payload = serde_json::to_vec(value)?;
        self.log.write(file, &payload)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, file: AssignmentFile) -> Result<Option<T>, ClusterError> {
        match self.log.read(file)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    /// Persists the three cluster-wide tables.
    pub fn save_tables(&self, tables: &SlotTables) -> Result<(), ClusterError> {
        self.save(AssignmentFile::SlotsAllocation, &tables.slots)?;
        self.save(AssignmentFile::SlotsReplicaAllocation, &tables.replicas)?;
        self.save(AssignmentFile::ReplicaNodeIds, &tables.replica_nodes)?;
        debug!(nodes = tables.slots.0.len(), "assignment tables persisted");
        Ok(())
    }

    /// Loads the cluster-wide tables, if all three were persisted.
    pub fn load_tables(&self) -> Result<Option<SlotTables>, ClusterError> {
        let slots: Option<SlotAssignmentTable> = self.load(AssignmentFile::SlotsAllocation)?;
        let replicas: Option<ReplicaAssignmentTable> =
            self.load(AssignmentFile::SlotsReplicaAllocation)?;
        let replica_nodes: Option<ReplicaNodeIndex> = self.load(AssignmentFile::ReplicaNodeIds)?;
        match (slots, replicas, replica_nodes) {
            (Some(slots), Some(replicas), Some(replica_nodes)) => Ok(Some(SlotTables {
                slots,
                replicas,
                replica_nodes,
            })),
            _ => Ok(None),
        }
    }

    /// Persists this node's primary and replica ranges.
    pub fn save_slice(&self, slice: &NodeSlice) -> Result<(), ClusterError> {
        self.save_node_slots(&slice.slots)?;
        self.save(AssignmentFile::NodeSlotsReplicas, &slice.replicas)
    }

    /// Persists this node's primary ranges alone.
    pub fn save_node_slots(&self, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        self.save(AssignmentFile::NodeSlots, &ranges)
    }

    /// Records the backing node of a node that holds no full tables.
    pub fn save_replica_node(&self, local: NodeId, holder: NodeId) -> Result<(), ClusterError> {
        let mut index = ReplicaNodeIndex::default();
        index.0.insert(local, holder);
        self.save(AssignmentFile::ReplicaNodeIds, &index)
    }

    /// Loads this node's slice, if its primary ranges were persisted.
    pub fn load_slice(&self, local: NodeId) -> Result<Option<NodeSlice>, ClusterError> {
        let Some(slots) = self.load::<Vec<SlotRange>>(AssignmentFile::NodeSlots)? else {
            return Ok(None);
        };
        let replicas = self
            .load::<Vec<SlotRange>>(AssignmentFile::NodeSlotsReplicas)?
            .unwrap_or_default();
        let replica_node = self
            .load::<ReplicaNodeIndex>(AssignmentFile::ReplicaNodeIds)?
            .and_then(|index| index.holder_of(local));
        Ok(Some(NodeSlice {
            slots,
            replicas,
            replica_node,
        }))
    }

}
