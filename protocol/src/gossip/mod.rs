//! # Gossip Module
//!
//! Epidemic message propagation for the SHOAL substrate. Registry updates
//! ride framed TCP messages that fan out to a few peers per hop; dedupe,
//! hop budgets, and TTLs bound the epidemic, and per-peer reliability
//! metrics steer it toward peers that actually answer.
//!
//! ```text
//! message.rs   — immutable envelope: hops, TTL, visited set, priority
//! wire.rs      — length-prefixed framing with opportunistic gzip
//! dedupe.rs    — bounded LRU+TTL of seen message ids
//! roster.rs    — peer metrics, quarantine, weighted fanout selection
//! transport.rs — listener, outbound priority pump, propagation rule
//! ```

pub mod dedupe;
pub mod message;
pub mod roster;
pub mod transport;
pub mod wire;

pub use dedupe::DedupeCache;
pub use message::{GossipMessage, GossipPayload, MessagePriority, RegistrySnapshot};
pub use roster::{PeerMetrics, PeerRoster};
pub use transport::{GossipStatsSnapshot, GossipTransport, MessageHandler};
pub use wire::{EncodedFrame, FLAG_COMPRESSED};
