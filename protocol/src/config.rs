//! # Substrate Configuration & Constants
//!
//! Every tunable in SHOAL lives here: the defaults as named constants, and
//! the typed configuration records the node binary layers its config file,
//! environment, and command-line flags onto. If you find a magic number
//! anywhere else in the tree, it escaped and should be marched back.
//!
//! Precedence is resolved in the binary (highest first): command line →
//! environment → config file → the `Default` impls below.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoalError};
use crate::registry::resolver::ConflictPolicy;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Substrate version string, stamped into peer metadata at registration.
pub const SUBSTRATE_VERSION: &str = "0.1.0";

/// Service type under which peers register themselves.
pub const SERVICE_TYPE_PEER: &str = "peer";

/// Service type under which trackers register themselves.
pub const SERVICE_TYPE_TRACKER: &str = "tracker";

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Default tracker listening port.
pub const DEFAULT_TRACKER_PORT: u16 = 6000;

/// A peer is alive iff its last heartbeat is strictly younger than this.
/// 90 seconds = three missed 30-second heartbeats. One lost packet should
/// not kill a registration; three in a row means the peer is gone.
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 90_000;

/// Default tracker connection-handler pool size.
pub const DEFAULT_TRACKER_POOL_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// Default gossip listening port.
pub const DEFAULT_GOSSIP_PORT: u16 = 6003;

/// Default gossip heartbeat/maintenance interval.
pub const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 5_000;

/// Base fanout: how many peers each message is forwarded to per hop.
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Default gossip message time-to-live. Messages older than this are
/// dropped on receipt regardless of hop budget.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 30_000;

/// Default hop budget. With fanout 3 this covers networks of several
/// hundred peers before anti-entropy has to pick up the stragglers.
pub const DEFAULT_MAX_HOPS: u32 = 6;

/// Per-send connect/write deadline for gossip frames.
pub const DEFAULT_GOSSIP_SEND_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on dedupe cache entries before eviction kicks in.
pub const DEDUPE_CACHE_CAPACITY: usize = 100_000;

/// Consecutive send failures before a peer is quarantined.
pub const QUARANTINE_THRESHOLD: u32 = 5;

/// Initial quarantine window. Doubles on each re-quarantine.
pub const QUARANTINE_BASE_BACKOFF_MS: u64 = 30_000;

/// Quarantine windows never grow past this.
pub const QUARANTINE_MAX_BACKOFF_MS: u64 = 300_000;

/// A roster peer counts as live if heard from within this window.
pub const ROSTER_LIVENESS_WINDOW_MS: u64 = 90_000;

/// Payloads above this size are candidates for compression.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

/// Compressed form is kept only if it shrinks the payload by at least
/// this fraction.
pub const COMPRESSION_MIN_GAIN: f64 = 0.10;

/// Hard cap on a single gossip frame. Anything larger is a protocol error,
/// not a snapshot.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Peer runtime
// ---------------------------------------------------------------------------

/// Default peer file-transfer listening port.
pub const DEFAULT_PEER_PORT: u16 = 6001;

/// Socket read/write deadline for file-transfer connections.
pub const DEFAULT_PEER_SOCKET_TIMEOUT_MS: u64 = 30_000;

/// Default tracker heartbeat interval. Actual cadence is jittered into
/// [interval/2, interval] so a fleet of peers does not stampede.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Registry / anti-entropy
// ---------------------------------------------------------------------------

/// How often each peer pushes its full snapshot to a few random peers.
pub const DEFAULT_ANTI_ENTROPY_INTERVAL_MS: u64 = 60_000;

/// How many random peers each anti-entropy round targets.
pub const DEFAULT_ANTI_ENTROPY_PEERS: usize = 3;

/// How long a deregistration tombstone is retained to suppress
/// resurrection by stale gossip. An order of magnitude above the message
/// TTL, so no in-flight register can outlive the tombstone that killed it.
pub const TOMBSTONE_TTL_MS: u64 = 600_000;

// ---------------------------------------------------------------------------
// Typed configuration records
// ---------------------------------------------------------------------------

/// Tracker control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// TCP port for the line protocol. 0 binds an ephemeral port.
    pub port: u16,
    /// Host peers should use to reach this tracker.
    pub advertise_host: String,
    /// Liveness window: alive iff `now - last_seen < peer_timeout_ms`.
    pub peer_timeout_ms: u64,
    /// Connection-handler pool size.
    pub pool_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TRACKER_PORT,
            advertise_host: "127.0.0.1".to_string(),
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            pool_size: DEFAULT_TRACKER_POOL_SIZE,
        }
    }
}

/// Gossip transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Whether distributed discovery runs at all. When off, the node only
    /// talks to its tracker.
    pub enabled: bool,
    /// TCP port for framed gossip. 0 binds an ephemeral port.
    pub port: u16,
    /// Host other peers should use to reach this transport.
    pub advertise_host: String,
    /// Maintenance interval (owned-instance heartbeats, metric decay).
    pub interval_ms: u64,
    /// Base fanout F₀.
    pub fanout: usize,
    /// When true, fanout scales as `ceil(F₀ · log2(N))` with the healthy
    /// peer count N.
    pub adaptive_fanout: bool,
    /// Message time-to-live in milliseconds.
    pub message_ttl_ms: u64,
    /// Hop budget for every message originated here.
    pub max_hops: u32,
    /// Per-send connect/write deadline.
    pub send_timeout_ms: u64,
    /// Initial roster, as `host:port` strings.
    pub bootstrap_peers: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_GOSSIP_PORT,
            advertise_host: "127.0.0.1".to_string(),
            interval_ms: DEFAULT_GOSSIP_INTERVAL_MS,
            fanout: DEFAULT_GOSSIP_FANOUT,
            adaptive_fanout: true,
            message_ttl_ms: DEFAULT_MESSAGE_TTL_MS,
            max_hops: DEFAULT_MAX_HOPS,
            send_timeout_ms: DEFAULT_GOSSIP_SEND_TIMEOUT_MS,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Peer runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// TCP port for the file-transfer protocol. 0 binds an ephemeral port.
    pub port: u16,
    /// Host other peers should use to reach this peer.
    pub advertise_host: String,
    /// Socket deadline for transfer connections.
    pub socket_timeout_ms: u64,
    /// Tracker heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Deployment region tag, carried in registry metadata.
    pub region: String,
    /// Files this peer shares, as filesystem paths.
    pub shared_files: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PEER_PORT,
            advertise_host: "127.0.0.1".to_string(),
            socket_timeout_ms: DEFAULT_PEER_SOCKET_TIMEOUT_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            region: "default".to_string(),
            shared_files: Vec::new(),
        }
    }
}

/// Anti-entropy reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiEntropyConfig {
    /// Interval between snapshot pushes.
    pub interval_ms: u64,
    /// Random peers targeted per round.
    pub peers: usize,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_ANTI_ENTROPY_INTERVAL_MS,
            peers: DEFAULT_ANTI_ENTROPY_PEERS,
        }
    }
}

/// Aggregate node configuration: everything a peer or tracker process needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable peer identity. Empty means "generate one at startup".
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub anti_entropy: AntiEntropyConfig,
    /// Which conflict-resolution policy the registry applies.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Per-origin priorities for the ORIGIN_PRIORITY / COMPOSITE policies.
    #[serde(default)]
    pub origin_priorities: BTreeMap<String, i32>,
}

impl NodeConfig {
    /// Validates cross-field constraints that serde cannot express.
    ///
    /// Port 0 is allowed (ephemeral bind, used heavily by tests); the u16
    /// type already enforces the 65535 ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.gossip.fanout == 0 {
            return Err(ShoalError::InvalidArgument(
                "gossip.fanout must be at least 1".into(),
            ));
        }
        if self.gossip.max_hops == 0 {
            return Err(ShoalError::InvalidArgument(
                "gossip.max_hops must be at least 1".into(),
            ));
        }
        if self.gossip.message_ttl_ms == 0 {
            return Err(ShoalError::InvalidArgument(
                "gossip.message_ttl_ms must be positive".into(),
            ));
        }
        if self.tracker.peer_timeout_ms == 0 {
            return Err(ShoalError::InvalidArgument(
                "tracker.peer_timeout_ms must be positive".into(),
            ));
        }
        if self.peer.heartbeat_interval_secs == 0 {
            return Err(ShoalError::InvalidArgument(
                "peer.heartbeat_interval_secs must be positive".into(),
            ));
        }
        for addr in &self.gossip.bootstrap_peers {
            validate_peer_addr(addr)?;
        }
        Ok(())
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.peer.heartbeat_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Current wall-clock time as Unix milliseconds.
///
/// All substrate timestamps (instance versions, message ages, liveness
/// tables) use this one clock.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A fresh random peer identity, for nodes started without one.
pub fn generate_peer_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("peer-{}", &id[..12])
}

/// Parses a comma-separated `host:port,host:port` bootstrap list,
/// validating each entry.
pub fn parse_peer_list(raw: &str) -> Result<Vec<String>> {
    let mut peers = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        validate_peer_addr(part)?;
        peers.push(part.to_string());
    }
    Ok(peers)
}

/// Checks that an address string looks like `host:port` with a port in
/// 1..=65535.
pub fn validate_peer_addr(addr: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        ShoalError::InvalidArgument(format!("peer address '{addr}' is not host:port"))
    })?;
    if host.is_empty() {
        return Err(ShoalError::InvalidArgument(format!(
            "peer address '{addr}' has an empty host"
        )));
    }
    let port: u32 = port.parse().map_err(|_| {
        ShoalError::InvalidArgument(format!("peer address '{addr}' has a bad port"))
    })?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(ShoalError::InvalidArgument(format!(
            "peer address '{addr}' port out of range 1..65535"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.tracker.port, 6000);
        assert_eq!(cfg.tracker.peer_timeout_ms, 90_000);
        assert_eq!(cfg.gossip.port, 6003);
        assert_eq!(cfg.gossip.interval_ms, 5_000);
        assert_eq!(cfg.gossip.fanout, 3);
        assert_eq!(cfg.gossip.message_ttl_ms, 30_000);
        assert_eq!(cfg.peer.socket_timeout_ms, 30_000);
        assert_eq!(cfg.peer.heartbeat_interval_secs, 30);
        assert_eq!(cfg.anti_entropy.interval_ms, 60_000);
        assert_eq!(cfg.anti_entropy.peers, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_fanout() {
        let mut cfg = NodeConfig::default();
        cfg.gossip.fanout = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ShoalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_bootstrap_peer() {
        let mut cfg = NodeConfig::default();
        cfg.gossip.bootstrap_peers = vec!["not-an-address".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn peer_list_parsing() {
        let peers = parse_peer_list("10.0.0.1:6003, 10.0.0.2:6003,").unwrap();
        assert_eq!(peers, vec!["10.0.0.1:6003", "10.0.0.2:6003"]);

        assert!(parse_peer_list("10.0.0.1:0").is_err());
        assert!(parse_peer_list("10.0.0.1:99999").is_err());
        assert!(parse_peer_list(":6003").is_err());
        assert!(parse_peer_list("bare-host").is_err());
    }

    #[test]
    fn config_roundtrips_through_serde() {
        // The node binary deserializes this struct from TOML; serde_json
        // exercises the same derive paths.
        let cfg = NodeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tracker.port, cfg.tracker.port);
        assert_eq!(back.gossip.fanout, cfg.gossip.fanout);
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are past 2020.
        assert!(a > 1_577_836_800_000);
    }
}
