use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use atomic_raft::runtime::TimerConfig;
use atomic_raft::server::{Config, Server};
use atomic_raft::telemetry::{init_logging, LogFormat};
use clap::Parser;

/// A cluster member hosting replicated atomic values.
#[derive(Parser)]
#[command(name = "atomic-node", version)]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long, env = "ATOMIC_ID")]
    id: u64,

    /// TCP address to listen on for Raft RPCs.
    #[arg(long, env = "ATOMIC_ADDR")]
    addr: String,

    /// Address for the HTTP client API.
    #[arg(long, env = "ATOMIC_CLIENT_ADDR")]
    client_addr: Option<String>,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer", env = "ATOMIC_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Directory for persistent state (meta.json, log.jsonl, snapshot.json).
    #[arg(long, env = "ATOMIC_DATA_DIR")]
    data_dir: PathBuf,

    #[arg(long, env = "ATOMIC_ELECTION_TIMEOUT_MS", default_value_t = 300)]
    election_timeout_ms: u64,

    #[arg(long, env = "ATOMIC_HEARTBEAT_INTERVAL_MS", default_value_t = 100)]
    heartbeat_interval_ms: u64,

    /// Leader read lease; must not exceed the election timeout.
    #[arg(long, env = "ATOMIC_LEASE_MS", default_value_t = 250)]
    lease_ms: u64,

    /// Idle client sessions are forgotten after this long.
    #[arg(long, env = "ATOMIC_SESSION_TIMEOUT_SECS", default_value_t = 60)]
    session_timeout_secs: u64,

    /// Snapshot the state machine every N applied entries (0 disables).
    #[arg(long, env = "ATOMIC_SNAPSHOT_THRESHOLD", default_value_t = 1000)]
    snapshot_threshold: u64,

    /// How long the client API waits for a command to be applied.
    #[arg(long, env = "ATOMIC_REQUEST_TIMEOUT_MS", default_value_t = 2000)]
    request_timeout_ms: u64,

    /// `pretty` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(args.log_format)?;

    let mut peers: HashMap<String, String> = HashMap::new();
    for p in &args.peers {
        let (id, addr) = p
            .split_once('=')
            .ok_or_else(|| format!("--peer must be ID=ADDR, got: {p}"))?;
        peers.insert(id.to_string(), addr.to_string());
    }

    Server::start(Config {
        id: args.id,
        addr: args.addr,
        client_addr: args.client_addr,
        peers,
        data_dir: args.data_dir,
        timers: TimerConfig {
            election_timeout: Duration::from_millis(args.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            lease_duration: Duration::from_millis(args.lease_ms),
        },
        session_timeout: Duration::from_secs(args.session_timeout_secs),
        snapshot_threshold: args.snapshot_threshold,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    })?
    .run()?;

    Ok(())
}
