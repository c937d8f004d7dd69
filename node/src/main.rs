// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SHOAL Node
//!
//! Entry point for the `shoal-node` binary. Parses CLI arguments, layers
//! configuration (flags → env → file → defaults), initializes logging,
//! and wires the substrate components through the topological bootstrap.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — start a file-sharing peer node
//! - `tracker` — start a standalone tracker
//! - `get`     — fetch one file from a running peer
//! - `version` — print build version information

mod cli;
mod logging;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;

use shoal_protocol::bootstrap::{Bootstrap, Component};
use shoal_protocol::config::generate_peer_id;
use shoal_protocol::gossip::GossipTransport;
use shoal_protocol::peer::{PeerRuntime, PeerState, SharedFiles};
use shoal_protocol::registry::{ConflictResolver, DistributedRegistry};
use shoal_protocol::tracker::TrackerServer;
use shoal_protocol::ShoalError;

use cli::{Commands, ShoalNodeCli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ShoalNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_peer(args).await,
        Commands::Tracker(args) => run_tracker(args).await,
        Commands::Get(args) => fetch_file(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Component adapters
// ---------------------------------------------------------------------------

struct TransportComponent(Arc<GossipTransport>);

#[async_trait]
impl Component for TransportComponent {
    fn id(&self) -> &str {
        "gossip-transport"
    }

    async fn start(&self) -> shoal_protocol::Result<()> {
        self.0.start().await.map(|_| ())
    }

    async fn stop(&self) -> shoal_protocol::Result<()> {
        self.0.stop();
        Ok(())
    }

    fn ready(&self) -> bool {
        self.0.is_running()
    }
}

struct RegistryComponent(Arc<DistributedRegistry>);

#[async_trait]
impl Component for RegistryComponent {
    fn id(&self) -> &str {
        "registry"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["gossip-transport".to_string()]
    }

    async fn start(&self) -> shoal_protocol::Result<()> {
        self.0.start();
        Ok(())
    }

    async fn stop(&self) -> shoal_protocol::Result<()> {
        self.0.stop();
        Ok(())
    }

    fn ready(&self) -> bool {
        self.0.is_running()
    }
}

struct TrackerComponent(Arc<TrackerServer>);

#[async_trait]
impl Component for TrackerComponent {
    fn id(&self) -> &str {
        "tracker"
    }

    async fn start(&self) -> shoal_protocol::Result<()> {
        self.0.start().await.map(|_| ())
    }

    async fn stop(&self) -> shoal_protocol::Result<()> {
        self.0.stop();
        Ok(())
    }

    fn ready(&self) -> bool {
        self.0.is_running()
    }
}

struct PeerComponent {
    runtime: Arc<PeerRuntime>,
    deps: Vec<String>,
}

#[async_trait]
impl Component for PeerComponent {
    fn id(&self) -> &str {
        "peer"
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn start(&self) -> shoal_protocol::Result<()> {
        self.runtime.start().await.map(|_| ())
    }

    async fn stop(&self) -> shoal_protocol::Result<()> {
        self.runtime.stop().await;
        Ok(())
    }

    fn ready(&self) -> bool {
        self.runtime.state() == PeerState::Running
    }
}

// ---------------------------------------------------------------------------
// run — file-sharing peer
// ---------------------------------------------------------------------------

/// Starts the full peer node.
///
/// Startup sequence:
/// 1. Layer configuration and validate it
/// 2. Initialize logging
/// 3. Resolve the peer identity and shared files
/// 4. Build transport → registry → peer runtime
/// 5. Start components in dependency order
/// 6. Print the banner, park until SIGINT/SIGTERM stops the components
async fn run_peer(args: cli::RunArgs) -> Result<()> {
    anyhow::ensure!(
        cli::validate_log_level(&args.log_level),
        "invalid log level '{}'",
        args.log_level
    );
    logging::init(&args.log_level, &args.log_format);

    let base = settings::load_base(args.config.as_deref())?;
    let config = settings::apply_run_args(base, &args)?;

    let peer_id = if config.peer_id.is_empty() {
        generate_peer_id()
    } else {
        config.peer_id.clone()
    };

    let files = Arc::new(SharedFiles::new());
    for path in &config.peer.shared_files {
        let stored = files
            .add(path)
            .map_err(|e| anyhow::anyhow!("cannot share '{path}': {e}"))?;
        tracing::info!(file = %stored.display(), "sharing file");
    }

    let mut boot = Bootstrap::new();
    let mut peer_deps = Vec::new();

    let (transport, registry) = if config.gossip.enabled {
        let transport = GossipTransport::new(config.gossip.clone());
        let resolver = ConflictResolver::new(config.conflict_policy)
            .with_origin_priorities(config.origin_priorities.clone());
        let registry = DistributedRegistry::new(
            &peer_id,
            resolver,
            Arc::clone(&transport),
            config.gossip.clone(),
            config.anti_entropy.clone(),
        );
        boot.register(Arc::new(TransportComponent(Arc::clone(&transport))))
            .map_err(to_anyhow)?;
        boot.register(Arc::new(RegistryComponent(Arc::clone(&registry))))
            .map_err(to_anyhow)?;
        peer_deps.push("registry".to_string());
        (Some(transport), Some(registry))
    } else {
        tracing::warn!("gossip disabled; peer discovery limited to the tracker");
        (None, None)
    };

    let runtime = PeerRuntime::new(
        &peer_id,
        config.peer.clone(),
        &settings::tracker_endpoint(&config),
        Arc::clone(&files),
        registry
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn shoal_protocol::registry::ServiceDirectory>),
    );
    boot.register(Arc::new(PeerComponent {
        runtime: Arc::clone(&runtime),
        deps: peer_deps,
    }))
    .map_err(to_anyhow)?;

    let order = boot.start_all().await.map_err(to_anyhow)?;
    tracing::info!(?order, "all components started");

    print_banner(
        &peer_id,
        &format!("{}:{}", config.peer.advertise_host, runtime.port()),
        transport
            .as_ref()
            .map(|t| t.self_addr())
            .unwrap_or_else(|| "disabled".to_string()),
        &settings::tracker_endpoint(&config),
        files.count(),
    );

    boot.run_until_signal().await;
    if let Some(registry) = &registry {
        let stats = registry.statistics();
        tracing::info!(
            registry_version = stats.registry_version,
            total_services = stats.total_services,
            "final registry statistics"
        );
    }
    tracing::info!("shoal-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// tracker — standalone tracker
// ---------------------------------------------------------------------------

async fn run_tracker(args: cli::TrackerArgs) -> Result<()> {
    anyhow::ensure!(
        cli::validate_log_level(&args.log_level),
        "invalid log level '{}'",
        args.log_level
    );
    logging::init(&args.log_level, &args.log_format);

    let base = settings::load_base(args.config.as_deref())?;
    let config = settings::apply_tracker_args(base, &args)?;

    let mut boot = Bootstrap::new();

    let registry = if config.gossip.enabled {
        let transport = GossipTransport::new(config.gossip.clone());
        let resolver = ConflictResolver::new(config.conflict_policy)
            .with_origin_priorities(config.origin_priorities.clone());
        let registry = DistributedRegistry::new(
            &format!("tracker-{}", config.tracker.port),
            resolver,
            Arc::clone(&transport),
            config.gossip.clone(),
            config.anti_entropy.clone(),
        );
        boot.register(Arc::new(TransportComponent(transport)))
            .map_err(to_anyhow)?;
        boot.register(Arc::new(RegistryComponent(Arc::clone(&registry))))
            .map_err(to_anyhow)?;
        Some(registry)
    } else {
        None
    };

    let tracker = TrackerServer::new(
        config.tracker.clone(),
        registry
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn shoal_protocol::registry::ServiceDirectory>),
    );
    boot.register(Arc::new(TrackerComponent(Arc::clone(&tracker))))
        .map_err(to_anyhow)?;

    boot.start_all().await.map_err(to_anyhow)?;
    println!(
        "tracker listening on port {} (peer timeout {}ms)",
        tracker.port(),
        config.tracker.peer_timeout_ms
    );

    boot.run_until_signal().await;
    tracing::info!("tracker stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// get — one-shot file fetch
// ---------------------------------------------------------------------------

async fn fetch_file(args: cli::GetArgs) -> Result<()> {
    logging::init("warn", "pretty");

    let download = shoal_protocol::peer::download(&args.peer, &args.file, &args.out)
        .await
        .with_context(|| format!("failed to fetch '{}' from {}", args.file, args.peer))?;

    println!("{}", download.path.display());
    println!("  size     : {} bytes", download.size);
    println!("  sha-256  : {}", download.checksum);
    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("shoal-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "substrate  {}",
        shoal_protocol::config::SUBSTRATE_VERSION
    );
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit     {commit}");
    }
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the node startup banner with a configuration summary.
fn print_banner(peer_id: &str, transfer: &str, gossip: String, tracker: &str, files: usize) {
    println!();
    println!("  SHOAL peer node v{}", env!("CARGO_PKG_VERSION"));
    println!("  ───────────────────────────────────────");
    println!("  Peer ID   : {peer_id}");
    println!("  Transfer  : {transfer}");
    println!("  Gossip    : {gossip}");
    println!("  Tracker   : {tracker}");
    println!("  Sharing   : {files} file(s)");
    println!();
}

fn to_anyhow(e: ShoalError) -> anyhow::Error {
    anyhow::anyhow!(e)
}
