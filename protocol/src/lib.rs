// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SHOAL — Core Library
//!
//! The substrate of a peer-to-peer file-sharing network: an open set of
//! processes that discover one another, announce the files they host,
//! route transfer requests, detect failed peers, and converge on a shared
//! view of who runs what — with no master anywhere in the picture.
//!
//! ## Architecture
//!
//! The crate is split along the actual fault lines of such a system:
//!
//! - **registry** — The replicated service map: vector clocks, conflict
//!   resolution, the apply rule, anti-entropy.
//! - **gossip** — Epidemic transport: framed TCP, fanout, dedupe, TTLs,
//!   peer quarantine.
//! - **tracker** — The centralized liveness plane: line protocol,
//!   heartbeats, discovery.
//! - **peer** — The file-sharing runtime: transfer protocol, startup
//!   state machine, heartbeat worker.
//! - **resilience** — Retry, circuit breaking, and the per-operation
//!   pipeline that composes them.
//! - **workers** — Named, monitored worker pools with graceful shutdown.
//! - **bootstrap** — Components as data and a topological starter.
//! - **config** / **error** — One place for tunables, one error language.
//!
//! ## Design Philosophy
//!
//! 1. Eventual consistency is a feature; pretending to have more is a bug.
//! 2. State is instance-owned and passed explicitly. No global mutable maps.
//! 3. Messages are immutable values; "modify" means "copy with a change".
//! 4. Every failure is classified. Retry what is transient, fail fast on
//!    what is not, and say which is which in the type.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gossip;
pub mod peer;
pub mod registry;
pub mod resilience;
pub mod tracker;
pub mod workers;

pub use error::{Result, ShoalError};
