//! # CLI Interface
//!
//! Defines the command-line argument structure for `shoal-node` using
//! `clap` derive. Supports four subcommands: `run`, `tracker`, `get`,
//! and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SHOAL peer-to-peer file sharing node.
///
/// Runs a file-sharing peer (transfer server, tracker heartbeats, and a
/// gossip-replicated service registry), a standalone tracker, or a
/// one-shot file fetch against a running peer.
#[derive(Parser, Debug)]
#[command(
    name = "shoal-node",
    about = "SHOAL peer-to-peer file sharing node",
    version,
    propagate_version = true
)]
pub struct ShoalNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the SHOAL node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a file-sharing peer node.
    Run(RunArgs),
    /// Start a standalone tracker.
    Tracker(TrackerArgs),
    /// Fetch one file from a running peer and exit.
    Get(GetArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a TOML configuration file. Flags and environment override
    /// values from the file.
    #[arg(long, short = 'c', env = "SHOAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stable peer identity. Generated when omitted.
    #[arg(long, env = "SHOAL_PEER_ID")]
    pub peer_id: Option<String>,

    /// Port for the file-transfer protocol.
    #[arg(long, env = "SHOAL_PEER_PORT")]
    pub peer_port: Option<u16>,

    /// Port for the gossip transport.
    #[arg(long, env = "SHOAL_GOSSIP_PORT")]
    pub gossip_port: Option<u16>,

    /// Host other peers should use to reach this node.
    #[arg(long, env = "SHOAL_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Tracker to register with, as host:port.
    #[arg(long, env = "SHOAL_TRACKER")]
    pub tracker_addr: Option<String>,

    /// Bootstrap gossip peers, comma-separated host:port.
    #[arg(long, env = "SHOAL_BOOTSTRAP_PEERS")]
    pub bootstrap_peers: Option<String>,

    /// File to share. Repeatable.
    #[arg(long = "share", value_name = "PATH")]
    pub shared_files: Vec<PathBuf>,

    /// Conflict policy: LAST_WRITE_WINS, VECTOR_CLOCK, ORIGIN_PRIORITY,
    /// HEALTH_PRIORITY, or COMPOSITE.
    #[arg(long, env = "SHOAL_CONFLICT_POLICY")]
    pub conflict_policy: Option<String>,

    /// Region tag carried in registry metadata.
    #[arg(long, env = "SHOAL_REGION")]
    pub region: Option<String>,

    /// Disable gossip and the distributed registry (tracker-only mode).
    #[arg(long)]
    pub no_gossip: bool,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, env = "SHOAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "SHOAL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `tracker` subcommand.
#[derive(Parser, Debug)]
pub struct TrackerArgs {
    /// Path to a TOML configuration file.
    #[arg(long, short = 'c', env = "SHOAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tracker listening port.
    #[arg(long, env = "SHOAL_TRACKER_PORT")]
    pub port: Option<u16>,

    /// Liveness window in milliseconds.
    #[arg(long, env = "SHOAL_PEER_TIMEOUT_MS")]
    pub peer_timeout_ms: Option<u64>,

    /// Also run gossip + registry and self-register under "tracker".
    #[arg(long)]
    pub with_registry: bool,

    /// Bootstrap gossip peers, comma-separated host:port (with
    /// --with-registry).
    #[arg(long, env = "SHOAL_BOOTSTRAP_PEERS")]
    pub bootstrap_peers: Option<String>,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, env = "SHOAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "SHOAL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `get` subcommand.
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Peer to fetch from, as host:port.
    #[arg(long, env = "SHOAL_PEER")]
    pub peer: String,

    /// Name of the file to fetch.
    pub file: String,

    /// Directory to write the file into.
    #[arg(long, short = 'o', default_value = ".")]
    pub out: PathBuf,
}

/// Whether a log level string is one tracing understands.
pub fn validate_log_level(level: &str) -> bool {
    matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}
