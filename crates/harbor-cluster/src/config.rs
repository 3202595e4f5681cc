//! Node configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::{ClusterError, NodeId};

/// Default peer port.
pub const DEFAULT_PEER_PORT: u16 = 7946;

/// Default port advertised to registry clients.
pub const DEFAULT_CLIENT_PORT: u16 = 8761;

/// Everything a [`Node`](crate::Node) needs to join the cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Whether this node takes part in controller elections.
    pub controller_candidate: bool,
    /// Address advertised to peers in the handshake.
    pub advertise_ip: IpAddr,
    /// Address the peer listener binds to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Port registry clients connect to; advertised, never bound here.
    pub client_port: u16,
    /// Peers dialed on startup.
    pub seeds: Vec<SocketAddr>,
    /// Number of connected peers to wait for before electing or asking
    /// for a slot slice.
    pub expected_peers: usize,
    /// Directory holding the assignment log.
    pub data_dir: PathBuf,
    /// Immediate dial attempts before an address goes to the retry list.
    pub dial_attempts: u32,
    /// How often the retry list is swept.
    pub reconnect_interval: Duration,
    /// How often dead directory entries are dropped.
    pub housekeeping_interval: Duration,
    /// Capacity of each per-peer send queue and of the shared receive queue.
    pub send_queue_capacity: usize,
    /// Drop a peer after this long without an inbound frame.
    pub idle_timeout: Option<Duration>,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            controller_candidate: true,
            advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PEER_PORT),
            client_port: DEFAULT_CLIENT_PORT,
            seeds: Vec::new(),
            expected_peers: 0,
            data_dir: PathBuf::from("./data"),
            dial_attempts: 3,
            reconnect_interval: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(30),
            send_queue_capacity: 1024,
            idle_timeout: None,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Checks values the node cannot run with.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.dial_attempts == 0 {
            return Err(ClusterError::Configuration(
                "dial_attempts must be at least 1".into(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(ClusterError::Configuration(
                "send_queue_capacity must be at least 1".into(),
            ));
        }
        // a frame must at least carry its type tag
        if self.max_frame_size < 4 || self.max_frame_size > u32::MAX as usize {
            return Err(ClusterError::Configuration(format!(
                "max_frame_size {} out of range",
                self.max_frame_size
            )));
        }
        if self.reconnect_interval.is_zero() || self.housekeeping_interval.is_zero() {
            return Err(ClusterError::Configuration(
                "sweep intervals must be non-zero".into(),
            ));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ClusterError::Configuration(
                "idle_timeout must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}
