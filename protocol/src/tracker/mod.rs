//! # Tracker Module
//!
//! The centralized liveness control plane that complements the gossip
//! registry: peers register and heartbeat over a one-line-per-request TCP
//! protocol, and the tracker answers discovery and liveness queries from
//! its `peer → last-seen` table.
//!
//! ```text
//! protocol.rs — command parsing and response rendering
//! server.rs   — accept loop, liveness table, expiry sweep
//! client.rs   — peer-side client with per-call deadlines
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::TrackerClient;
pub use protocol::{TrackedPeer, TrackerCommand, TrackerResponse};
pub use server::TrackerServer;
