//! harbor-cluster: the cluster control plane for harbor.
//!
//! Peer server nodes use this crate to agree on a single controller and on
//! how the 16384 routing slots of the service keyspace are split and
//! backed up across the cluster.
//!
//! # Architecture
//!
//! - **Transport**: persistent TCP links between peers with a handshake,
//!   length-prefixed frames and per-peer send queues
//! - **Directory**: the connected peers and their roles
//! - **Dispatch**: routes decoded messages to whoever waits for them
//! - **Election**: round-based quorum vote among controller candidates
//! - **Partitioning**: contiguous slot ranges per node plus a random
//!   backing node for each range, computed by the controller
//! - **Store**: the slots a node owns, with pluggable per-slot data
//! - **Persistence**: checksummed assignment files for restart
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use harbor_cluster::{Node, NodeConfig, NodeId};
//!
//! let config = NodeConfig {
//!     node_id: NodeId(1),
//!     ..Default::default()
//! };
//! let node = Node::<harbor_cluster::OpaqueSlot>::bind(config).await?;
//! node.start().await?;
//!
//! // route a service name to its slot
//! let slot = node.store().get_slot("order-service");
//! assert!(node.store().owns(slot));
//! ```

mod config;
mod directory;
mod dispatch;
mod election;
mod error;
mod message;
mod node;
mod partition;
mod persist;
mod slots;
mod store;
mod topology;
mod transport;

pub use config::{NodeConfig, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
pub use directory::PeerDirectory;
pub use dispatch::{Delivery, Inbox};
pub use election::{Election, RoundOutcome, Vote};
pub use error::ClusterError;
pub use message::{Handshake, MessageKind, PeerMessage};
pub use node::Node;
pub use partition::{
    assign_replicas, split_slots, NodeSlice, ReplicaAssignmentTable, ReplicaNodeIndex,
    SlotAssignmentTable, SlotTables,
};
pub use persist::AssignmentStore;
pub use slots::{ranges_from_slots, route_slot, SlotRange, FIRST_SLOT, SLOT_COUNT};
pub use store::{OpaqueSlot, SlotData, SlotStore, TransferReport};
pub use topology::{LifecycleState, NodeId, NodeIdentity, NodeRole};
pub use transport::Transport;
