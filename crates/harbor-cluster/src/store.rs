//! Per-node store of owned slots.
//!
//! Every node materializes the slots it owns as primaries and the ranges it
//! backs up for another node. Each slot is backed by a [`SlotData`] holder
//! supplied by the registry layer; the store only cares whether a holder is
//! empty, how to serialize it for a transfer, and how to merge transferred
//! contents in.

use std::sync::RwLock;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tracing::debug;

use crate::slots::{ranges_from_slots, route_slot, SlotRange};
use crate::NodeId;

/// Contents of one slot.
pub trait SlotData: Default + Send + Sync + 'static {
    /// Returns true if a transfer of this slot would carry nothing.
    fn is_empty(&self) -> bool;

    /// Serializes the contents for an `UPDATE_SLOTS` transfer.
    fn serialize(&self) -> Bytes;

    /// Merges contents received in a transfer.
    fn transfer_in(&mut self, data: Bytes);
}

/// Slot data kept as an opaque byte buffer.
///
/// Transfers append to whatever the slot already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueSlot {
    data: BytesMut,
}

impl OpaqueSlot {
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self {
            data: BytesMut::from(data.as_ref()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }
}

impl SlotData for OpaqueSlot {
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    fn transfer_in(&mut self, data: Bytes) {
        self.data.extend_from_slice(&data);
    }
}

/// Outcome of moving a range of slots away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Slots whose contents were handed to the send callback and removed.
    pub sent: usize,
    /// Empty slots removed without sending anything.
    pub dropped_empty: usize,
    /// Slots kept because the send callback refused them.
    pub failed: Vec<u16>,
}

impl TransferReport {
    /// Slots that left the store.
    pub fn removed(&self) -> usize {
        self.sent + self.dropped_empty
    }
}

/// The primary and replica slots held by one node.
pub struct SlotStore<D: SlotData = OpaqueSlot> {
    primaries: DashMap<u16, D>,
    /// Replica holders keyed by the range they back up.
    replicas: DashMap<SlotRange, DashMap<u16, D>>,
    replica_node: RwLock<Option<NodeId>>,
}

impl<D: SlotData> Default for SlotStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: SlotData> SlotStore<D> {
    pub fn new() -> Self {
        Self {
            primaries: DashMap::new(),
            replicas: DashMap::new(),
            replica_node: RwLock::new(None),
        }
    }

    /// Allocates empty holders for every slot in `ranges`.
    ///
    /// Slots already held keep their contents.
    pub fn init(&self, ranges: &[SlotRange]) {
        for range in ranges {
            for slot in range.iter() {
                self.primaries.entry(slot).or_default();
            }
        }
        debug!(slots = self.primaries.len(), "slot store initialized");
    }

    /// Replaces the primary ranges, keeping contents of surviving slots.
    pub fn reset_ranges(&self, ranges: &[SlotRange]) {
        self.primaries
            .retain(|slot, _| ranges.iter().any(|r| r.contains(*slot)));
        self.init(ranges);
    }

    /// Replaces the replica ranges.
    ///
    /// Ranges kept from the previous set keep their contents; new ranges
    /// get empty holders.
    pub fn init_replicas(&self, ranges: &[SlotRange]) {
        self.replicas.retain(|range, _| ranges.contains(range));
        for range in ranges {
            self.replicas
                .entry(*range)
                .or_insert_with(|| range.iter().map(|slot| (slot, D::default())).collect());
        }
    }

    pub fn set_replica_node(&self, node: Option<NodeId>) {
        if let Ok(mut guard) = self.replica_node.write() {
            *guard = node;
        }
    }

    /// The node backing up this node's primaries.
    pub fn replica_node(&self) -> Option<NodeId> {
        self.replica_node.read().ok().and_then(|guard| *guard)
    }

    /// Routes a service name to its slot.
    pub fn get_slot(&self, service_name: &str) -> u16 {
        route_slot(service_name)
    }

    /// Routes a service name and returns the slot only if held as primary.
    pub fn owned_slot(&self, service_name: &str) -> Option<u16> {
        let slot = route_slot(service_name);
        self.primaries.contains_key(&slot).then_some(slot)
    }

    pub fn owns(&self, slot: u16) -> bool {
        self.primaries.contains_key(&slot)
    }

    /// Serialized contents of a primary slot.
    pub fn get_slot_data(&self, slot: u16) -> Option<Bytes> {
        self.primaries.get(&slot).map(|d| d.serialize())
    }

    /// Reads a primary slot in place.
    pub fn with_slot<R>(&self, slot: u16, f: impl FnOnce(&D) -> R) -> Option<R> {
        self.primaries.get(&slot).map(|d| f(d.value()))
    }

    /// Mutates a primary slot. Returns false if the slot is not held.
    pub fn update_slot_data(&self, slot: u16, f: impl FnOnce(&mut D)) -> bool {
        match self.primaries.get_mut(&slot) {
            Some(mut data) => {
                f(data.value_mut());
                true
            }
            None => false,
        }
    }

    /// Installs `data` as the holder of `slot`, replacing any previous one.
    pub fn put_slot(&self, slot: u16, data: D) -> Option<D> {
        self.primaries.insert(slot, data)
    }

    /// Takes ownership of `slot` if it is not held yet. Returns true if the
    /// slot was newly added.
    pub fn put_slot_if_absent(&self, slot: u16) -> bool {
        let mut added = false;
        self.primaries.entry(slot).or_insert_with(|| {
            added = true;
            D::default()
        });
        added
    }

    pub fn remove_slot(&self, slot: u16) -> Option<D> {
        self.primaries.remove(&slot).map(|(_, data)| data)
    }

    /// The replica range containing `slot`, found by linear scan.
    pub fn replica_range_for(&self, slot: u16) -> Option<SlotRange> {
        self.replicas
            .iter()
            .map(|e| *e.key())
            .find(|range| range.contains(slot))
    }

    /// Serialized contents of a replica slot.
    pub fn get_replica_data(&self, slot: u16) -> Option<Bytes> {
        let range = self.replica_range_for(slot)?;
        let holders = self.replicas.get(&range)?;
        let data = holders.get(&slot)?;
        Some(data.serialize())
    }

    /// Mutates a replica slot. Returns false if the slot is not backed up here.
    pub fn update_replica_data(&self, slot: u16, f: impl FnOnce(&mut D)) -> bool {
        let Some(range) = self.replica_range_for(slot) else {
            return false;
        };
        let Some(holders) = self.replicas.get(&range) else {
            return false;
        };
        let Some(mut data) = holders.get_mut(&slot) else {
            return false;
        };
        f(data.value_mut());
        true
    }

    /// Primary slots collapsed into ranges.
    pub fn owned_ranges(&self) -> Vec<SlotRange> {
        ranges_from_slots(self.primaries.iter().map(|e| *e.key()))
    }

    /// Replica ranges, ascending.
    pub fn replica_ranges(&self) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = self.replicas.iter().map(|e| *e.key()).collect();
        ranges.sort();
        ranges
    }

    /// Number of primary slots held.
    pub fn slot_count(&self) -> usize {
        self.primaries.len()
    }

    /// Moves every held slot of `range` out of the store.
    ///
    /// Non-empty slots are serialized and handed to `send`; a slot leaves
    /// the store only if `send` accepts it. Empty slots are removed without
    /// calling `send`. Slots of `range` not held here are skipped.
    pub fn take_range(
        &self,
        range: SlotRange,
        mut send: impl FnMut(u16, Bytes) -> bool,
    ) -> TransferReport {
        let mut report = TransferReport::default();
        for slot in range.iter() {
            let payload = match self.primaries.get(&slot) {
                Some(data) if data.is_empty() => None,
                Some(data) => Some(data.serialize()),
                None => continue,
            };
            match payload {
                None => {
                    self.primaries.remove(&slot);
                    report.dropped_empty += 1;
                }
                Some(bytes) => {
                    if send(slot, bytes) {
                        self.primaries.remove(&slot);
                        report.sent += 1;
                    } else {
                        report.failed.push(slot);
                    }
                }
            }
        }
        report
    }

    /// Returns true if any held slot of `range` has contents.
    pub fn has_data_in(&self, range: SlotRange) -> bool {
        range
            .iter()
            .any(|slot| self.primaries.get(&slot).is_some_and(|d| !d.is_empty()))
    }

}
