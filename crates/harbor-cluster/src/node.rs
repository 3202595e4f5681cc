//! The cluster node: startup sequence, controller duties and the handlers
//! that keep the local slot store in line with what peers send.
//!
//! A node is built in two steps. [`Node::bind`] opens the assignment log,
//! binds the peer listener and starts the dispatcher, so peers can already
//! reach it. [`Node::start`] then dials the seeds and runs the join
//! sequence:
//!
//! - a candidate that sees a controller among its peers asks it for the
//!   tables,
//! - otherwise candidates elect a controller; the winner partitions the
//!   keyspace and distributes the tables, the others wait for them,
//! - a non-candidate waits for its slice (or reloads it from disk).
//!
//! Only after its slice is in place does a node report
//! [`LifecycleState::Started`]. Any fault on the way leaves it `Failed`.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::dispatch::{run_dispatcher, Inbox};
use crate::election::{Election, RoundOutcome};
use crate::message::{MessageKind, PeerMessage};
use crate::partition::{NodeSlice, SlotTables};
use crate::persist::AssignmentStore;
use crate::slots::SlotRange;
use crate::store::{OpaqueSlot, SlotData, SlotStore, TransferReport};
use crate::topology::{LifecycleState, NodeRole};
use crate::transport::Transport;
use crate::{ClusterError, NodeId};

/// Every message kind a started node keeps handling.
const SERVICE_KINDS: [MessageKind; 13] = [
    MessageKind::Vote,
    MessageKind::SlotsAllocation,
    MessageKind::NodeSlots,
    MessageKind::SlotsReplicaAllocation,
    MessageKind::NodeSlotsReplicas,
    MessageKind::ReplicaNodeId,
    MessageKind::ReplicaNodeIds,
    MessageKind::ControllerNodeId,
    MessageKind::RequestSlotsData,
    MessageKind::TransferSlots,
    MessageKind::UpdateSlots,
    MessageKind::UpdateNodeSlots,
    MessageKind::UpdateReplicaNodeId,
];

/// One member of the cluster.
pub struct Node<D: SlotData = OpaqueSlot> {
    config: Arc<NodeConfig>,
    directory: Arc<PeerDirectory>,
    transport: Arc<Transport>,
    inbox: Arc<Inbox>,
    store: SlotStore<D>,
    assignments: AssignmentStore,
    lifecycle: watch::Sender<LifecycleState>,
    role: RwLock<NodeRole>,
    controller: RwLock<Option<NodeId>>,
    /// Full tables; held by candidates once the cluster has formed.
    tables: RwLock<Option<SlotTables>>,
    peer_addr: SocketAddr,
}

fn unexpected(kind: MessageKind, msg: &PeerMessage) -> ClusterError {
    ClusterError::Decode(format!("expected {kind:?}, got {:?}", msg.kind()))
}

impl<D: SlotData> Node<D> {
    /// Opens the assignment log, binds the peer listener and starts the
    /// dispatcher and background sweeps.
    pub async fn bind(config: NodeConfig) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let assignments = AssignmentStore::open(&config.data_dir)?;
        let config = Arc::new(config);

        let (lifecycle, lifecycle_rx) = watch::channel(LifecycleState::Created);
        let directory = Arc::new(PeerDirectory::new(config.node_id));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.send_queue_capacity);
        let transport = Arc::new(Transport::new(
            Arc::clone(&config),
            Arc::clone(&directory),
            inbound_tx,
            lifecycle_rx.clone(),
        ));
        let inbox = Arc::new(Inbox::new());

        lifecycle.send_replace(LifecycleState::Initialized);
        let peer_addr = transport.listen().await?;
        tokio::spawn(run_dispatcher(inbound_rx, Arc::clone(&inbox), lifecycle_rx));
        transport.spawn_sweeps();

        let role = if config.controller_candidate {
            NodeRole::ControllerCandidate
        } else {
            NodeRole::Node
        };
        info!(node = %config.node_id, %role, %peer_addr, "node initialized");

        Ok(Arc::new(Self {
            config,
            directory,
            transport,
            inbox,
            store: SlotStore::new(),
            assignments,
            lifecycle,
            role: RwLock::new(role),
            controller: RwLock::new(None),
            tables: RwLock::new(None),
            peer_addr,
        }))
    }

    /// Dials the seeds and joins the cluster.
    ///
    /// Returns once the node is started. There is no timeout: a peer that
    /// never answers keeps this pending.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        match self.join().await {
            Ok(()) => {
                self.set_state(LifecycleState::Started);
                self.spawn_services();
                info!(
                    node = %self.node_id(),
                    role = %self.role(),
                    slots = self.store.slot_count(),
                    "node started"
                );
                Ok(())
            }
            Err(e) => {
                error!(node = %self.node_id(), "startup failed: {e}");
                if self.state() != LifecycleState::Shutdown {
                    self.set_state(LifecycleState::Failed);
                }
                Err(e)
            }
        }
    }

    async fn join(&self) -> Result<(), ClusterError> {
        for seed in &self.config.seeds {
            match self.transport.connect(*seed).await {
                Ok(true) => {}
                Ok(false) => debug!(%seed, "seed not reachable yet"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(%seed, "seed connection failed: {e}"),
            }
        }
        self.wait_for_peers().await?;

        if self.config.controller_candidate {
            if let Some(controller) = self.directory.controller() {
                info!(%controller, "controller already elected, requesting tables");
                self.set_controller(controller);
                self.request_slots_data(controller)?;
                return self.await_tables().await;
            }

            let winner = self.elect().await?;
            self.set_controller(winner);
            if winner == self.node_id() {
                info!(node = %winner, "elected controller");
                self.set_role(NodeRole::Controller);
                self.transport.set_controller(true);
                self.allocate_slots()
            } else {
                info!(controller = %winner, "controller elected");
                self.await_tables().await
            }
        } else {
            if let Some(slice) = self.assignments.load_slice(self.node_id())? {
                info!(slots = slice.slots.len(), "resuming from persisted slice");
                self.install_slice(&slice);
                return Ok(());
            }
            if let Some(controller) = self.directory.controller() {
                self.set_controller(controller);
                self.request_slots_data(controller)?;
            }
            self.await_slice().await
        }
    }

    async fn wait_for_peers(&self) -> Result<(), ClusterError> {
        let expected = self.config.expected_peers;
        if expected == 0 {
            return Ok(());
        }
        debug!(expected, "waiting for peers");
        let mut count = self.directory.subscribe_count();
        count
            .wait_for(|n| *n >= expected)
            .await
            .map_err(|_| ClusterError::Shutdown)?;
        Ok(())
    }

    fn request_slots_data(&self, controller: NodeId) -> Result<(), ClusterError> {
        let msg = PeerMessage::RequestSlotsData(self.node_id());
        if self.transport.send(controller, msg.encode()) {
            Ok(())
        } else {
            Err(ClusterError::NodeNotFound(controller))
        }
    }

    // -- election --

    /// Runs rounds until the candidates agree on a controller.
    async fn elect(&self) -> Result<NodeId, ClusterError> {
        let mut election = Election::new(self.node_id(), self.directory.candidates());
        info!(
            candidates = election.candidate_count(),
            quorum = Election::quorum(election.candidate_count()),
            "starting controller election"
        );

        let mut outcome = self.cast_vote(&mut election);
        loop {
            match outcome {
                RoundOutcome::Decided(winner) => return Ok(winner),
                RoundOutcome::NextRound { .. } => outcome = self.cast_vote(&mut election),
                RoundOutcome::Pending => {
                    let (from, msg) = self.inbox.wait(MessageKind::Vote).await?;
                    match msg {
                        PeerMessage::Vote(vote) if vote.voter == from => {
                            trace!(voter = %from, controller = %vote.controller, round = vote.round, "vote received");
                            outcome = election.record_vote(vote);
                        }
                        PeerMessage::Vote(vote) => {
                            warn!(peer = %from, voter = %vote.voter, "ignoring vote cast on behalf of another node");
                        }
                        other => return Err(unexpected(MessageKind::Vote, &other)),
                    }
                }
            }
        }
    }

    /// Sends the local vote for the current round and records it.
    fn cast_vote(&self, election: &mut Election) -> RoundOutcome {
        let vote = election.current_vote();
        let payload = PeerMessage::Vote(vote).encode();
        let peers: Vec<NodeId> = election
            .candidates()
            .filter(|id| *id != self.node_id())
            .collect();
        for peer in peers {
            if !self.transport.send(peer, payload.clone()) {
                warn!(%peer, round = vote.round, "vote not delivered");
            }
        }
        debug!(round = vote.round, proposal = %vote.controller, "vote cast");
        election.record_vote(vote)
    }

    // -- controller duties --

    /// Partitions the keyspace over the connected peers, persists and
    /// distributes the tables, then installs the local slice.
    fn allocate_slots(&self) -> Result<(), ClusterError> {
        let peers = self.directory.ids();
        let tables = match self.reusable_tables(&peers) {
            Some(tables) => {
                info!("reusing persisted assignment tables");
                tables
            }
            None => SlotTables::compute(self.node_id(), peers.iter().copied(), &mut rand::rng()),
        };

        // nothing is sent unless the tables are on disk
        self.assignments.save_tables(&tables)?;
        let own = tables.slice_for(self.node_id());
        self.assignments.save_slice(&own)?;

        for peer in self.directory.candidates() {
            self.send_tables(peer, &tables);
        }
        for peer in self.directory.non_candidates() {
            self.send_slice(peer, &tables.slice_for(peer));
        }
        let announce = PeerMessage::ControllerNodeId(self.node_id()).encode();
        for peer in self.directory.ids() {
            self.transport.send(peer, announce.clone());
        }

        self.install_slice(&own);
        info!(
            nodes = tables.slots.0.len(),
            slots = self.store.slot_count(),
            "slots allocated"
        );
        self.set_tables(Some(tables));
        Ok(())
    }

    /// Persisted tables that cover exactly the current members.
    fn reusable_tables(&self, peers: &[NodeId]) -> Option<SlotTables> {
        let persisted = match self.assignments.load_tables() {
            Ok(tables) => tables?,
            Err(e) => {
                warn!("ignoring unreadable persisted tables: {e}");
                return None;
            }
        };
        let mut members: std::collections::BTreeSet<NodeId> = peers.iter().copied().collect();
        members.insert(self.node_id());
        (persisted.nodes() == members && persisted.slots.is_complete()).then_some(persisted)
    }

    fn send_tables(&self, peer: NodeId, tables: &SlotTables) {
        let messages = [
            PeerMessage::SlotsAllocation(tables.slots.clone()),
            PeerMessage::ReplicaNodeIds(tables.replica_nodes.clone()),
            PeerMessage::SlotsReplicaAllocation(tables.replicas.clone()),
        ];
        for msg in messages {
            if !self.transport.send(peer, msg.encode()) {
                warn!(%peer, kind = ?msg.kind(), "table not delivered");
            }
        }
        debug!(%peer, "tables sent");
    }

    fn send_slice(&self, peer: NodeId, slice: &NodeSlice) {
        let mut messages = vec![
            PeerMessage::NodeSlots(slice.slots.clone()),
            PeerMessage::NodeSlotsReplicas(slice.replicas.clone()),
        ];
        if let Some(holder) = slice.replica_node {
            messages.push(PeerMessage::ReplicaNodeId(holder));
        }
        for msg in messages {
            if !self.transport.send(peer, msg.encode()) {
                warn!(%peer, kind = ?msg.kind(), "slice not delivered");
            }
        }
        debug!(%peer, slots = slice.slots.len(), "slice sent");
    }

    // -- receiving assignments --

    /// Waits for the three full tables from the controller.
    async fn await_tables(&self) -> Result<(), ClusterError> {
        let (from, msg) = self.inbox.wait(MessageKind::SlotsAllocation).await?;
        let PeerMessage::SlotsAllocation(slots) = msg else {
            return Err(unexpected(MessageKind::SlotsAllocation, &msg));
        };
        let (_, msg) = self.inbox.wait(MessageKind::ReplicaNodeIds).await?;
        let PeerMessage::ReplicaNodeIds(replica_nodes) = msg else {
            return Err(unexpected(MessageKind::ReplicaNodeIds, &msg));
        };
        let (_, msg) = self.inbox.wait(MessageKind::SlotsReplicaAllocation).await?;
        let PeerMessage::SlotsReplicaAllocation(replicas) = msg else {
            return Err(unexpected(MessageKind::SlotsReplicaAllocation, &msg));
        };
        debug!(controller = %from, nodes = slots.0.len(), "tables received");

        let tables = SlotTables {
            slots,
            replicas,
            replica_nodes,
        };
        self.assignments.save_tables(&tables)?;
        let own = tables.slice_for(self.node_id());
        self.assignments.save_slice(&own)?;
        self.install_slice(&own);
        self.set_tables(Some(tables));
        Ok(())
    }

    /// Waits for this node's own slice from the controller.
    async fn await_slice(&self) -> Result<(), ClusterError> {
        let (_, msg) = self.inbox.wait(MessageKind::NodeSlots).await?;
        let PeerMessage::NodeSlots(slots) = msg else {
            return Err(unexpected(MessageKind::NodeSlots, &msg));
        };
        let (_, msg) = self.inbox.wait(MessageKind::NodeSlotsReplicas).await?;
        let PeerMessage::NodeSlotsReplicas(replicas) = msg else {
            return Err(unexpected(MessageKind::NodeSlotsReplicas, &msg));
        };

        // a node without slots has nobody backing it up
        let replica_node = if slots.is_empty() {
            None
        } else {
            let (_, msg) = self.inbox.wait(MessageKind::ReplicaNodeId).await?;
            let PeerMessage::ReplicaNodeId(holder) = msg else {
                return Err(unexpected(MessageKind::ReplicaNodeId, &msg));
            };
            Some(holder)
        };

        let slice = NodeSlice {
            slots,
            replicas,
            replica_node,
        };
        self.assignments.save_slice(&slice)?;
        if let Some(holder) = replica_node {
            self.assignments.save_replica_node(self.node_id(), holder)?;
        }
        self.install_slice(&slice);
        Ok(())
    }

    fn install_slice(&self, slice: &NodeSlice) {
        self.store.init(&slice.slots);
        self.store.init_replicas(&slice.replicas);
        self.store.set_replica_node(slice.replica_node);
    }

    // -- started-node services --

    fn spawn_services(self: &Arc<Self>) {
        for kind in SERVICE_KINDS {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                while let Ok((from, msg)) = node.inbox.wait(kind).await {
                    match node.handle(from, msg) {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            error!(peer = %from, ?kind, "handling message failed: {e}");
                        }
                        Err(e) => warn!(peer = %from, ?kind, "handling message failed: {e}"),
                    }
                }
                trace!(?kind, "service stopped");
            });
        }
    }

    fn handle(&self, from: NodeId, msg: PeerMessage) -> Result<(), ClusterError> {
        match msg {
            PeerMessage::Vote(vote) => {
                trace!(peer = %from, round = vote.round, "late vote ignored");
            }
            PeerMessage::RequestSlotsData(requester) => self.answer_slots_request(requester)?,
            PeerMessage::ControllerNodeId(controller) => {
                info!(%controller, "controller announced");
                self.set_controller(controller);
            }
            PeerMessage::TransferSlots { target, range } => {
                let report = self.transfer_slots(target, range)?;
                info!(peer = %from, %target, %range, sent = report.sent, "transfer command handled");
            }
            PeerMessage::UpdateSlots { slot, data } => {
                let added = self.store.put_slot_if_absent(slot);
                self.store.update_slot_data(slot, |d| d.transfer_in(data));
                trace!(peer = %from, slot, "slot data received");
                if added {
                    self.assignments.save_node_slots(&self.store.owned_ranges())?;
                }
            }
            PeerMessage::UpdateNodeSlots(ranges) | PeerMessage::NodeSlots(ranges) => {
                self.store.reset_ranges(&ranges);
                self.assignments.save_node_slots(&ranges)?;
                info!(peer = %from, ranges = ranges.len(), "primary ranges replaced");
            }
            PeerMessage::UpdateReplicaNodeId(holder) | PeerMessage::ReplicaNodeId(holder) => {
                self.store.set_replica_node(Some(holder));
                let tables = self.update_tables(|t| {
                    t.replica_nodes.0.insert(self.node_id(), holder);
                })?;
                if tables.is_none() {
                    self.assignments.save_replica_node(self.node_id(), holder)?;
                }
                info!(peer = %from, %holder, "replica node replaced");
            }
            PeerMessage::NodeSlotsReplicas(ranges) => {
                self.store.init_replicas(&ranges);
                let slice = NodeSlice {
                    slots: self.store.owned_ranges(),
                    replicas: ranges,
                    replica_node: self.store.replica_node(),
                };
                self.assignments.save_slice(&slice)?;
            }
            PeerMessage::SlotsAllocation(slots) => {
                let own = slots.ranges_for(self.node_id());
                self.store.reset_ranges(&own);
                self.update_tables(|t| t.slots = slots)?;
                self.assignments.save_node_slots(&own)?;
            }
            PeerMessage::SlotsReplicaAllocation(replicas) => {
                let own = replicas.ranges_for(self.node_id());
                self.store.init_replicas(&own);
                self.update_tables(|t| t.replicas = replicas)?;
            }
            PeerMessage::ReplicaNodeIds(index) => {
                self.store.set_replica_node(index.holder_of(self.node_id()));
                self.update_tables(|t| t.replica_nodes = index)?;
            }
        }
        Ok(())
    }

    /// Applies `f` to the held tables and persists them. Returns the new
    /// tables, or `None` if this node holds none.
    fn update_tables(
        &self,
        f: impl FnOnce(&mut SlotTables),
    ) -> Result<Option<SlotTables>, ClusterError> {
        let updated = {
            let Ok(mut guard) = self.tables.write() else {
                return Ok(None);
            };
            let Some(tables) = guard.as_mut() else {
                return Ok(None);
            };
            f(tables);
            tables.clone()
        };
        self.assignments.save_tables(&updated)?;
        Ok(Some(updated))
    }

    /// Re-sends assignments to a node that asked for them.
    fn answer_slots_request(&self, requester: NodeId) -> Result<(), ClusterError> {
        let Some(tables) = self.tables() else {
            return Err(ClusterError::WrongRole {
                role: self.role().to_string(),
            });
        };
        let Some(identity) = self.directory.get(requester) else {
            return Err(ClusterError::NodeNotFound(requester));
        };
        if identity.is_controller_candidate {
            self.send_tables(requester, &tables);
        } else {
            self.send_slice(requester, &tables.slice_for(requester));
        }
        Ok(())
    }

    // -- public operations --

    /// Moves the locally held slots of `range` to `target`.
    ///
    /// Every non-empty slot is serialized and sent as `UPDATE_SLOTS` before
    /// it is removed here; empty slots are removed without sending. The
    /// shrunk primary ranges are persisted. Fails up front if there is data
    /// to move and `target` is not connected.
    ///
    /// The target only takes ownership of slots it receives data for. Hand
    /// over the empty slots of `range` with [`Node::update_node_slots`].
    pub fn transfer_slots(
        &self,
        target: NodeId,
        range: SlotRange,
    ) -> Result<TransferReport, ClusterError> {
        if self.store.has_data_in(range) && !self.directory.contains(target) {
            return Err(ClusterError::NodeNotFound(target));
        }

        let report = self.store.take_range(range, |slot, data| {
            self.transport
                .send(target, PeerMessage::UpdateSlots { slot, data }.encode())
        });
        if !report.failed.is_empty() {
            warn!(%target, failed = report.failed.len(), "some slots were not transferred");
        }
        if report.removed() > 0 {
            self.assignments.save_node_slots(&self.store.owned_ranges())?;
        }
        debug!(%target, %range, sent = report.sent, dropped = report.dropped_empty, "slots transferred");
        Ok(report)
    }

    /// Asks `owner` to transfer its slots of `range` to `target`.
    pub fn request_transfer(&self, owner: NodeId, target: NodeId, range: SlotRange) -> bool {
        self.transport
            .send(owner, PeerMessage::TransferSlots { target, range }.encode())
    }

    /// Replaces the primary ranges of `node`.
    pub fn update_node_slots(&self, node: NodeId, ranges: Vec<SlotRange>) -> bool {
        self.transport
            .send(node, PeerMessage::UpdateNodeSlots(ranges).encode())
    }

    /// Replaces the backing node of `node`.
    pub fn update_replica_node(&self, node: NodeId, holder: NodeId) -> bool {
        self.transport
            .send(node, PeerMessage::UpdateReplicaNodeId(holder).encode())
    }

    /// Stops all loops and drops every peer connection.
    pub fn shutdown(&self) {
        if self.state() == LifecycleState::Shutdown {
            return;
        }
        self.set_state(LifecycleState::Shutdown);
        self.transport.disconnect_all();
        self.inbox.close();
        info!(node = %self.node_id(), "node shut down");
    }

    // -- accessors --

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the peer listener is bound to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn role(&self) -> NodeRole {
        self.role.read().map(|r| *r).unwrap_or(NodeRole::Node)
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// The elected controller, once known.
    pub fn controller(&self) -> Option<NodeId> {
        self.controller.read().ok().and_then(|c| *c)
    }

    /// The full assignment tables, if this node holds them.
    pub fn tables(&self) -> Option<SlotTables> {
        self.tables.read().ok().and_then(|t| t.clone())
    }

    pub fn store(&self) -> &SlotStore<D> {
        &self.store
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Client-facing addresses of this node and every connected peer,
    /// ordered by node id.
    pub fn server_addresses(&self) -> Vec<SocketAddr> {
        let own = SocketAddr::new(self.config.advertise_ip, self.config.client_port);
        let mut addrs = self.directory.client_addrs();
        addrs.push((self.node_id(), own));
        addrs.sort_by_key(|(id, _)| *id);
        addrs.into_iter().map(|(_, addr)| addr).collect()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.lifecycle.send_replace(state);
        debug!(node = %self.node_id(), from = %previous, to = %state, "lifecycle transition");
    }

    fn set_role(&self, role: NodeRole) {
        if let Ok(mut guard) = self.role.write() {
            *guard = role;
        }
    }

    fn set_controller(&self, controller: NodeId) {
        if let Ok(mut guard) = self.controller.write() {
            *guard = Some(controller);
        }
        self.directory.set_controller(controller);
    }

    fn set_tables(&self, tables: Option<SlotTables>) {
        if let Ok(mut guard) = self.tables.write() {
            *guard = tables;
        }
    }
}
