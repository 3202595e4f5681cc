//! Node identity and roles.
//!
//! Defines who a node is on the peer network, what part it plays in
//! controller election, and where the node is in its startup lifecycle.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster node.
///
/// Ids are assigned by configuration and compared numerically; election
/// ties resolve towards the largest id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for NodeId {
    fn from(id: i32) -> Self {
        NodeId(id)
    }
}

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Elected owner of partitioning decisions.
    Controller,
    /// Eligible for election, currently not the controller.
    ControllerCandidate,
    /// Holds slots but never takes part in elections.
    Node,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::ControllerCandidate => write!(f, "controller-candidate"),
            NodeRole::Node => write!(f, "node"),
        }
    }
}

/// Where a node is in its startup sequence.
///
/// The dispatcher runs while the state is `Initialized` or `Started`.
/// A node only serves registry traffic once `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, transport not yet open.
    Created,
    /// Transport open; electing or waiting for a slot slice.
    Initialized,
    /// Slot slice in place; serving.
    Started,
    /// Election or partitioning failed. Never serves.
    Failed,
    /// Orderly shutdown in progress or complete.
    Shutdown,
}

impl LifecycleState {
    /// Returns true while background loops should keep running.
    pub fn is_running(self) -> bool {
        matches!(self, LifecycleState::Initialized | LifecycleState::Started)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Failed => "failed",
            LifecycleState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Everything known about a connected peer.
///
/// Created from the handshake record when a connection comes up and
/// dropped when it goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    /// Address the peer advertises for itself.
    pub ip: IpAddr,
    /// Remote port of the peer connection.
    pub internal_port: u16,
    /// Port the peer serves registry clients on.
    pub client_port: u16,
    pub is_controller_candidate: bool,
    pub is_controller: bool,
}

impl NodeIdentity {
    /// Address registry clients should use to reach this peer.
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.client_port)
    }

    /// The role this peer currently plays.
    pub fn role(&self) -> NodeRole {
        if self.is_controller {
            NodeRole::Controller
        } else if self.is_controller_candidate {
            NodeRole::ControllerCandidate
        } else {
            NodeRole::Node
        }
    }
}
