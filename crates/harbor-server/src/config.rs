//! Server configuration file support.
//!
//! A TOML file mirrors the CLI flags. Values are resolved in the order
//! defaults → TOML file → env vars → CLI flags, then turned into the
//! cluster crate's [`NodeConfig`].

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use harbor_cluster::{NodeConfig, NodeId, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
use serde::{Deserialize, Serialize};

/// Parses a human-readable byte size string into a number of bytes.
///
/// Supports suffixes: K/KB (kibibytes), M/MB (mebibytes), G/GB (gibibytes).
/// Plain numbers are treated as bytes. Case insensitive.
///
/// # Examples
///
/// - "1024" → 1024
/// - "64K" → 65536
/// - "16M" → 16777216
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty byte size string".into());
    }

    let upper = input.to_ascii_uppercase();

    let (num_str, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else {
        (upper.as_str(), 1)
    };

    let num: usize = num_str
        .parse()
        .map_err(|_| format!("invalid byte size: '{input}'"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: '{input}'"))
}

/// Peer transport tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub dial_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub send_queue_capacity: usize,
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: u64,
    pub max_frame_size: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            dial_attempts: 3,
            reconnect_interval_ms: 5_000,
            housekeeping_interval_ms: 30_000,
            send_queue_capacity: 1024,
            idle_timeout_secs: 0,
            max_frame_size: "16M".into(),
        }
    }
}

/// Contents of the server's TOML configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    pub node_id: i32,
    pub controller_candidate: bool,
    /// Address advertised to peers and clients.
    pub advertise_ip: String,
    /// Address the peer listener binds to.
    pub bind: String,
    pub peer_port: u16,
    pub client_port: u16,
    /// Peer addresses (`host:port`) dialed on startup.
    pub seeds: Vec<String>,
    pub expected_peers: usize,
    pub data_dir: String,
    pub transport: TransportSection,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            controller_candidate: true,
            advertise_ip: "127.0.0.1".into(),
            bind: "0.0.0.0".into(),
            peer_port: DEFAULT_PEER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            seeds: Vec::new(),
            expected_peers: 0,
            data_dir: "./data".into(),
            transport: TransportSection::default(),
        }
    }
}

impl HarborConfig {
    /// Reads a config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::from_toml(&text)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Converts to the cluster crate's config, validating addresses.
    pub fn to_node_config(&self) -> Result<NodeConfig, String> {
        let advertise_ip: IpAddr = self
            .advertise_ip
            .parse()
            .map_err(|e| format!("invalid advertise_ip '{}': {e}", self.advertise_ip))?;
        let bind_ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {e}", self.bind))?;
        let seeds = self
            .seeds
            .iter()
            .map(|seed| resolve_seed(seed))
            .collect::<Result<Vec<_>, _>>()?;
        let max_frame_size = parse_byte_size(&self.transport.max_frame_size)
            .map_err(|e| format!("invalid max_frame_size: {e}"))?;
        let idle_timeout = match self.transport.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let config = NodeConfig {
            node_id: NodeId(self.node_id),
            controller_candidate: self.controller_candidate,
            advertise_ip,
            bind_addr: SocketAddr::new(bind_ip, self.peer_port),
            client_port: self.client_port,
            seeds,
            expected_peers: self.expected_peers,
            data_dir: PathBuf::from(&self.data_dir),
            dial_attempts: self.transport.dial_attempts,
            reconnect_interval: Duration::from_millis(self.transport.reconnect_interval_ms),
            housekeeping_interval: Duration::from_millis(self.transport.housekeeping_interval_ms),
            send_queue_capacity: self.transport.send_queue_capacity,
            idle_timeout,
            max_frame_size,
        };
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

/// Resolves a `host:port` seed to its first address.
fn resolve_seed(seed: &str) -> Result<SocketAddr, String> {
    seed.to_socket_addrs()
        .map_err(|e| format!("invalid seed '{seed}': {e}"))?
        .next()
        .ok_or_else(|| format!("seed '{seed}' resolved to no address"))
}
