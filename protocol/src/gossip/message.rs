//! # Gossip Messages
//!
//! The envelope every registry update travels in. An envelope carries the
//! routing fields the epidemic needs (hop budget, TTL, visited set,
//! priority) around a typed payload. Envelopes are immutable values:
//! `increment_hop` returns a new message and leaves the original alone,
//! which is what makes re-gossip safe to run concurrently with delivery.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::now_ms;
use crate::registry::instance::ServiceInstance;

/// A deep snapshot of the registry: `type → id → instance`.
pub type RegistrySnapshot = BTreeMap<String, BTreeMap<String, ServiceInstance>>;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Outbound delivery priority. Declared low-to-high so the derived `Ord`
/// makes `High` the greatest, which is what the outbound queue sorts by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The typed content of a gossip message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipPayload {
    /// A newly registered instance.
    ServiceRegister(ServiceInstance),
    /// A deregistration tombstone for an instance.
    ServiceDeregister(ServiceInstance),
    /// A changed instance (health flips, metadata updates).
    ServiceUpdate(ServiceInstance),
    /// Periodic proof-of-life for an owned instance. Applied as an update
    /// with the health flag forced on.
    Heartbeat(ServiceInstance),
    /// "Send me your snapshot", optionally filtered by service types.
    SyncRequest { requested_types: BTreeSet<String> },
    /// Reply to a sync request.
    SyncResponse {
        snapshot: RegistrySnapshot,
        sync_version: u64,
    },
    /// Unsolicited periodic snapshot push.
    AntiEntropy { snapshot: RegistrySnapshot },
}

impl GossipPayload {
    /// Short tag for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceRegister(_) => "SERVICE_REGISTER",
            Self::ServiceDeregister(_) => "SERVICE_DEREGISTER",
            Self::ServiceUpdate(_) => "SERVICE_UPDATE",
            Self::Heartbeat(_) => "HEARTBEAT",
            Self::SyncRequest { .. } => "SYNC_REQUEST",
            Self::SyncResponse { .. } => "SYNC_RESPONSE",
            Self::AntiEntropy { .. } => "ANTI_ENTROPY",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A routed gossip message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Globally unique id; the dedupe key.
    pub message_id: String,
    /// Gossip address (`host:port`) of the originating transport.
    pub sender_id: String,
    /// Creation time in Unix millis; the TTL reference point.
    pub timestamp_ms: u64,
    /// Hops taken so far.
    pub hop_count: u32,
    /// Hop budget; always ≥ 1.
    pub max_hops: u32,
    /// Transports this message has passed through. Fanout selection never
    /// targets a visited peer, which breaks propagation loops.
    pub visited_peers: BTreeSet<String>,
    pub priority: MessagePriority,
    /// Lifetime in milliseconds from `timestamp_ms`.
    pub ttl_ms: u64,
    pub payload: GossipPayload,
}

impl GossipMessage {
    /// Creates a fresh envelope originating at `sender_id`.
    pub fn new(
        sender_id: &str,
        payload: GossipPayload,
        priority: MessagePriority,
        max_hops: u32,
        ttl_ms: u64,
    ) -> Self {
        let mut visited = BTreeSet::new();
        visited.insert(sender_id.to_string());
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            timestamp_ms: now_ms(),
            hop_count: 0,
            max_hops: max_hops.max(1),
            visited_peers: visited,
            priority,
            ttl_ms,
            payload,
        }
    }

    /// Returns a copy one hop further along, with `peer` recorded in the
    /// visited set. The original is unchanged.
    pub fn increment_hop(&self, peer: &str) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next.visited_peers.insert(peer.to_string());
        next
    }

    /// Whether the hop budget allows another forward.
    pub fn can_propagate(&self) -> bool {
        self.hop_count < self.max_hops
    }

    /// Whether the message has outlived `ttl_ms` as of `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp_ms) > self.ttl_ms
    }

    /// Age of the message as of `now`, in milliseconds.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope(max_hops: u32, ttl_ms: u64) -> GossipMessage {
        let instance = ServiceInstance::new(
            "web",
            "svc1",
            "10.0.0.1",
            8080,
            BTreeMap::new(),
            "p1",
        )
        .unwrap();
        GossipMessage::new(
            "10.0.0.1:6003",
            GossipPayload::ServiceRegister(instance),
            MessagePriority::High,
            max_hops,
            ttl_ms,
        )
    }

    #[test]
    fn priority_orders_high_above_low() {
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[test]
    fn new_message_visits_its_sender() {
        let msg = envelope(4, 30_000);
        assert_eq!(msg.hop_count, 0);
        assert!(msg.visited_peers.contains("10.0.0.1:6003"));
        assert!(msg.can_propagate());
    }

    #[test]
    fn message_ids_are_unique_per_sender() {
        let a = envelope(4, 30_000);
        let b = envelope(4, 30_000);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn increment_hop_copies_and_leaves_original() {
        let msg = envelope(2, 30_000);
        let hopped = msg.increment_hop("10.0.0.2:6003");

        assert_eq!(msg.hop_count, 0);
        assert!(!msg.visited_peers.contains("10.0.0.2:6003"));

        assert_eq!(hopped.hop_count, 1);
        assert!(hopped.visited_peers.contains("10.0.0.2:6003"));
        assert_eq!(hopped.message_id, msg.message_id);
    }

    #[test]
    fn propagation_stops_at_max_hops() {
        let msg = envelope(2, 30_000);
        let h1 = msg.increment_hop("a");
        let h2 = h1.increment_hop("b");

        assert!(msg.can_propagate());
        assert!(h1.can_propagate());
        assert!(!h2.can_propagate());
    }

    #[test]
    fn max_hops_is_clamped_to_one() {
        let msg = envelope(0, 30_000);
        assert_eq!(msg.max_hops, 1);
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let msg = envelope(4, 1_000);
        assert!(!msg.is_expired(msg.timestamp_ms));
        assert!(!msg.is_expired(msg.timestamp_ms + 1_000));
        assert!(msg.is_expired(msg.timestamp_ms + 1_001));
        assert_eq!(msg.age_ms(msg.timestamp_ms + 250), 250);
    }

    #[test]
    fn payload_kinds_cover_all_variants() {
        let msg = envelope(4, 30_000);
        assert_eq!(msg.payload.kind(), "SERVICE_REGISTER");

        let sync = GossipPayload::SyncRequest {
            requested_types: BTreeSet::new(),
        };
        assert_eq!(sync.kind(), "SYNC_REQUEST");

        let ae = GossipPayload::AntiEntropy {
            snapshot: RegistrySnapshot::new(),
        };
        assert_eq!(ae.kind(), "ANTI_ENTROPY");
    }

    #[test]
    fn serde_roundtrip_preserves_every_field() {
        let msg = envelope(4, 30_000).increment_hop("10.0.0.2:6003");
        let json = serde_json::to_string(&msg).unwrap();
        let back: GossipMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
