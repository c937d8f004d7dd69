//! # Peer Module
//!
//! Everything a file-sharing peer runs: the shared-file set, the binary
//! transfer protocol, and the runtime that ties them to the tracker and
//! the registry.
//!
//! ```text
//! files.rs    — shared-file set and SHA-256 checksums
//! transfer.rs — writeUTF-framed GET_FILE server and client
//! runtime.rs  — startup state machine, registration, heartbeats
//! ```

pub mod files;
pub mod runtime;
pub mod transfer;

pub use files::SharedFiles;
pub use runtime::{PeerRuntime, PeerState};
pub use transfer::{download, Download};
