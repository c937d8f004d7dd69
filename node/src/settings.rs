//! # Configuration Layering
//!
//! Resolves the effective [`NodeConfig`] from, highest precedence first:
//! command-line flags → environment (clap merges those two) → TOML config
//! file → library defaults. Only values the user actually set override
//! the layer below; an absent flag never clobbers a file value.

use std::path::Path;

use anyhow::{Context, Result};

use shoal_protocol::config::{parse_peer_list, NodeConfig};
use shoal_protocol::registry::ConflictPolicy;

use crate::cli::{RunArgs, TrackerArgs};

/// Loads the config file layer, or defaults when no file is given.
pub fn load_base(config_path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = config_path else {
        return Ok(NodeConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: NodeConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Applies `run` flags/env on top of the base config.
pub fn apply_run_args(mut config: NodeConfig, args: &RunArgs) -> Result<NodeConfig> {
    if let Some(peer_id) = &args.peer_id {
        config.peer_id = peer_id.clone();
    }
    if let Some(port) = args.peer_port {
        config.peer.port = port;
    }
    if let Some(port) = args.gossip_port {
        config.gossip.port = port;
    }
    if let Some(host) = &args.advertise_host {
        config.peer.advertise_host = host.clone();
        config.gossip.advertise_host = host.clone();
    }
    if let Some(tracker) = &args.tracker_addr {
        let (host, port) = split_addr(tracker)?;
        config.tracker.advertise_host = host;
        config.tracker.port = port;
    }
    if let Some(peers) = &args.bootstrap_peers {
        config.gossip.bootstrap_peers =
            parse_peer_list(peers).context("invalid --bootstrap-peers")?;
    }
    if let Some(policy) = &args.conflict_policy {
        config.conflict_policy = policy
            .parse::<ConflictPolicy>()
            .context("invalid --conflict-policy")?;
    }
    if let Some(region) = &args.region {
        config.peer.region = region.clone();
    }
    if args.no_gossip {
        config.gossip.enabled = false;
    }
    for path in &args.shared_files {
        config.peer.shared_files.push(path.display().to_string());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Applies `tracker` flags/env on top of the base config.
pub fn apply_tracker_args(mut config: NodeConfig, args: &TrackerArgs) -> Result<NodeConfig> {
    if let Some(port) = args.port {
        config.tracker.port = port;
    }
    if let Some(timeout) = args.peer_timeout_ms {
        config.tracker.peer_timeout_ms = timeout;
    }
    if let Some(peers) = &args.bootstrap_peers {
        config.gossip.bootstrap_peers =
            parse_peer_list(peers).context("invalid --bootstrap-peers")?;
    }
    config.gossip.enabled = args.with_registry;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// The tracker endpoint the peer runtime dials, as `host:port`.
pub fn tracker_endpoint(config: &NodeConfig) -> String {
    format!(
        "{}:{}",
        config.tracker.advertise_host, config.tracker.port
    )
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("'{addr}' is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("'{addr}' has a bad port"))?;
    anyhow::ensure!(!host.is_empty(), "'{addr}' has an empty host");
    anyhow::ensure!(port != 0, "'{addr}' port must be in 1..65535");
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write as _;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["run"];
        full.extend_from_slice(argv);
        RunArgs::parse_from(full)
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let config = load_base(None).unwrap();
        let config = apply_run_args(config, &run_args(&[])).unwrap();
        assert_eq!(config.tracker.port, 6000);
        assert_eq!(config.gossip.port, 6003);
        assert!(config.gossip.enabled);
    }

    #[test]
    fn file_layer_is_overridden_by_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shoal.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
peer_id = "from-file"

[gossip]
port = 7100
fanout = 5

[peer]
port = 7200
"#
        )
        .unwrap();

        let base = load_base(Some(&path)).unwrap();
        assert_eq!(base.peer_id, "from-file");
        assert_eq!(base.gossip.fanout, 5);

        let config =
            apply_run_args(base, &run_args(&["--gossip-port", "7999"])).unwrap();
        // Flag wins over file; untouched file values survive.
        assert_eq!(config.gossip.port, 7999);
        assert_eq!(config.gossip.fanout, 5);
        assert_eq!(config.peer.port, 7200);
        assert_eq!(config.peer_id, "from-file");
    }

    #[test]
    fn tracker_addr_flag_sets_host_and_port() {
        let config = apply_run_args(
            NodeConfig::default(),
            &run_args(&["--tracker-addr", "10.9.8.7:6500"]),
        )
        .unwrap();
        assert_eq!(config.tracker.advertise_host, "10.9.8.7");
        assert_eq!(config.tracker.port, 6500);
        assert_eq!(tracker_endpoint(&config), "10.9.8.7:6500");
    }

    #[test]
    fn bad_values_are_rejected_with_context() {
        assert!(apply_run_args(
            NodeConfig::default(),
            &run_args(&["--tracker-addr", "no-port-here"]),
        )
        .is_err());

        assert!(apply_run_args(
            NodeConfig::default(),
            &run_args(&["--bootstrap-peers", "a:0"]),
        )
        .is_err());

        assert!(apply_run_args(
            NodeConfig::default(),
            &run_args(&["--conflict-policy", "COIN_FLIP"]),
        )
        .is_err());
    }

    #[test]
    fn conflict_policy_flag_parses() {
        let config = apply_run_args(
            NodeConfig::default(),
            &run_args(&["--conflict-policy", "COMPOSITE"]),
        )
        .unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::Composite);
    }
}
