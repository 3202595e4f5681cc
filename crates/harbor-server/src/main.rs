mod config;

use std::path::PathBuf;

use clap::Parser;
use harbor_cluster::{LifecycleState, Node, OpaqueSlot};
use tracing::{error, info};

use crate::config::HarborConfig;

#[derive(Parser)]
#[command(name = "harbor-server", about = "harbor control-plane node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "HARBOR_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// numeric id of this node, unique in the cluster
    #[arg(long, env = "HARBOR_NODE_ID")]
    node_id: Option<i32>,

    /// never take part in controller elections
    #[arg(long, env = "HARBOR_NON_CANDIDATE")]
    non_candidate: bool,

    /// address advertised to peers and clients
    #[arg(long, env = "HARBOR_ADVERTISE_IP")]
    advertise_ip: Option<String>,

    /// address the peer listener binds to
    #[arg(long, env = "HARBOR_BIND")]
    bind: Option<String>,

    /// port for peer connections
    #[arg(long, env = "HARBOR_PEER_PORT")]
    peer_port: Option<u16>,

    /// port registry clients connect to
    #[arg(long, env = "HARBOR_CLIENT_PORT")]
    client_port: Option<u16>,

    /// peer to dial on startup (host:port). repeatable
    #[arg(long = "seed", env = "HARBOR_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// number of peers to wait for before electing a controller
    #[arg(long, env = "HARBOR_EXPECTED_PEERS")]
    expected_peers: Option<usize>,

    /// directory for the assignment files
    #[arg(long, env = "HARBOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// drop a peer after this many seconds without traffic (0 = never)
    #[arg(long, env = "HARBOR_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// largest accepted peer frame (e.g. "16M")
    #[arg(long, env = "HARBOR_MAX_FRAME_SIZE")]
    max_frame_size: Option<String>,
}

/// Applies CLI overrides to a `HarborConfig`. Only values given on the
/// CLI or in the environment take effect, preserving the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut HarborConfig, args: &Args) {
    if let Some(id) = args.node_id {
        cfg.node_id = id;
    }
    if args.non_candidate {
        cfg.controller_candidate = false;
    }
    if let Some(ref ip) = args.advertise_ip {
        cfg.advertise_ip = ip.clone();
    }
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.peer_port {
        cfg.peer_port = port;
    }
    if let Some(port) = args.client_port {
        cfg.client_port = port;
    }
    if !args.seeds.is_empty() {
        cfg.seeds = args.seeds.clone();
    }
    if let Some(n) = args.expected_peers {
        cfg.expected_peers = n;
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(secs) = args.idle_timeout_secs {
        cfg.transport.idle_timeout_secs = secs;
    }
    if let Some(ref size) = args.max_frame_size {
        cfg.transport.max_frame_size = size.clone();
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match HarborConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => HarborConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => HarborConfig::default(),
    };
    apply_args(&mut cfg, &args);
    let node_config = cfg.to_node_config().unwrap_or_else(|e| exit_err(e));

    let node: std::sync::Arc<Node<OpaqueSlot>> = match Node::bind(node_config).await {
        Ok(node) => node,
        Err(e) => exit_err(format!("failed to start node: {e}")),
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // joining can stall forever on a silent peer, so keep ctrl-c live
    tokio::select! {
        biased;

        _ = &mut shutdown => {
            info!("shutdown signal received before the node started");
            node.shutdown();
            return;
        }

        result = node.start() => {
            if let Err(e) = result {
                node.shutdown();
                exit_err(format!("node failed to join the cluster: {e}"));
            }
        }
    }

    info!(
        node = %node.node_id(),
        role = %node.role(),
        controller = ?node.controller(),
        servers = node.server_addresses().len(),
        "serving"
    );

    let mut state = node.subscribe_state();
    tokio::select! {
        _ = &mut shutdown => info!("shutdown signal received"),
        _ = state.wait_for(|s| *s == LifecycleState::Failed) => {
            error!("node failed");
        }
    }
    node.shutdown();
}
