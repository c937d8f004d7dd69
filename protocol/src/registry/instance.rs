//! # Service Instances
//!
//! The unit of replication in the registry: one discoverable endpoint
//! under a service type. Instances are immutable values; "mutation" means
//! the owning peer issues a new copy with a bumped version and an
//! incremented vector clock, and the gossip layer carries it outward.
//!
//! Identity for conflict detection is `(service_type, service_id)`. Two
//! instances with the same identity but different endpoint data are in
//! conflict, and the resolver decides which survives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::now_ms;
use crate::error::{Result, ShoalError};
use crate::registry::clock::VectorClock;

/// Metadata key marking a deregistration tombstone.
const TOMBSTONE_KEY: &str = "tombstone";

/// A discoverable service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Service category, e.g. `"peer"` or `"tracker"`. Non-empty.
    pub service_type: String,
    /// Unique id within the type. Non-empty.
    pub service_id: String,
    /// Reachable host. Non-empty.
    pub host: String,
    /// Reachable port, 1..=65535.
    pub port: u16,
    /// Free-form string attributes (region, capabilities, ...).
    pub metadata: BTreeMap<String, String>,
    /// Monotonic version; starts as the creator's wall-clock millis.
    pub version: u64,
    /// The peer that authored this version.
    pub origin_peer_id: String,
    /// Causal history of this instance.
    pub vector_clock: VectorClock,
    /// Health flag; the only field that changes without an endpoint change.
    pub healthy: bool,
    /// Load-balancing priority. Higher wins where policies care.
    pub priority: i32,
    /// Creation timestamp in Unix millis.
    pub created_at: u64,
}

impl ServiceInstance {
    /// Builds a fresh instance owned by `origin_peer_id`.
    ///
    /// Validates every identity and endpoint field; the version and
    /// creation time are stamped from the wall clock, and the vector clock
    /// starts with one event at the origin.
    pub fn new(
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
        origin_peer_id: &str,
    ) -> Result<Self> {
        if service_type.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "service_type must be non-empty".into(),
            ));
        }
        if service_id.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "service_id must be non-empty".into(),
            ));
        }
        if host.is_empty() {
            return Err(ShoalError::InvalidArgument("host must be non-empty".into()));
        }
        if port == 0 {
            return Err(ShoalError::InvalidArgument(
                "port must be in 1..=65535".into(),
            ));
        }
        if origin_peer_id.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "origin_peer_id must be non-empty".into(),
            ));
        }

        let now = now_ms();
        Ok(Self {
            service_type: service_type.to_string(),
            service_id: service_id.to_string(),
            host: host.to_string(),
            port,
            metadata,
            version: now,
            origin_peer_id: origin_peer_id.to_string(),
            vector_clock: VectorClock::with_peer(origin_peer_id)?,
            healthy: true,
            priority: 0,
            created_at: now,
        })
    }

    /// The conflict-detection identity.
    pub fn identity(&self) -> (String, String) {
        (self.service_type.clone(), self.service_id.clone())
    }

    /// `host:port` for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// "Newer than" under the replication total order: version first,
    /// then lexicographic origin peer id as the tiebreak.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (self.version, self.origin_peer_id.as_str())
            > (other.version, other.origin_peer_id.as_str())
    }

    /// True iff identities match and any replicated field differs.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.service_type == other.service_type
            && self.service_id == other.service_id
            && (self.host != other.host
                || self.port != other.port
                || self.version != other.version
                || self.metadata != other.metadata
                || self.origin_peer_id != other.origin_peer_id)
    }

    /// A version bump that stays monotonic even when the wall clock
    /// stands still or steps backwards.
    fn next_version(&self) -> u64 {
        now_ms().max(self.version + 1)
    }

    /// Issues the successor of this instance authored by `peer`: same
    /// endpoint, bumped version, incremented clock.
    pub fn successor(&self, peer: &str) -> Result<Self> {
        let mut next = self.clone();
        next.version = self.next_version();
        next.origin_peer_id = peer.to_string();
        next.vector_clock = self.vector_clock.increment(peer)?;
        Ok(next)
    }

    /// Issues a successor with the health flag set.
    pub fn with_health(&self, peer: &str, healthy: bool) -> Result<Self> {
        let mut next = self.successor(peer)?;
        next.healthy = healthy;
        Ok(next)
    }

    /// Issues the deregistration tombstone for this instance.
    ///
    /// The tombstone dominates the live entry (incremented clock, bumped
    /// version) so it wins the same apply rule everywhere, and it is
    /// flagged in metadata so late receivers can tell removal from update.
    pub fn tombstone(&self, peer: &str) -> Result<Self> {
        let mut stone = self.successor(peer)?;
        stone.healthy = false;
        stone
            .metadata
            .insert(TOMBSTONE_KEY.to_string(), "true".to_string());
        Ok(stone)
    }

    /// True iff this instance is a deregistration marker.
    pub fn is_tombstone(&self) -> bool {
        self.metadata.get(TOMBSTONE_KEY).map(String::as_str) == Some("true")
    }
}

impl std::fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{} v{} by {}",
            self.service_type,
            self.service_id,
            self.address(),
            self.version,
            self.origin_peer_id
        )
    }
}
