//! # Tracker Line Protocol
//!
//! One request line in, one response line out, newline-terminated ASCII.
//! The grammar is deliberately small enough to drive with `nc`:
//!
//! ```text
//! REGISTER <peerId> <port>   →  REGISTERED <peerId> | ERROR <code> <msg>
//! HEARTBEAT <peerId>         →  HEARTBEAT_ACK
//! DEREGISTER <peerId>        →  DEREGISTERED <peerId> | ERROR <code> <msg>
//! DISCOVER                   →  PEERS [id@host:port, ...]
//! IS_PEER_ALIVE <peerId>     →  ALIVE | NOT_ALIVE
//! anything else              →  ERROR UNKNOWN_COMMAND <msg>
//! ```
//!
//! The `PEERS` line is a human-readable dump, not a machine contract;
//! peers discover each other through the registry.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A parsed tracker request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    Register { peer_id: String, port: u16 },
    Heartbeat { peer_id: String },
    Deregister { peer_id: String },
    Discover,
    IsPeerAlive { peer_id: String },
}

impl TrackerCommand {
    /// Parses one request line. Parse failures come back as the `ERROR`
    /// response to write, so the connection handler never has to invent
    /// error text.
    pub fn parse(line: &str) -> Result<Self, TrackerResponse> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");

        let command = match verb {
            "REGISTER" => {
                let peer_id = required(parts.next(), "REGISTER needs <peerId> <port>")?;
                let port_raw = required(parts.next(), "REGISTER needs <peerId> <port>")?;
                let port: u16 = port_raw.parse().map_err(|_| {
                    TrackerResponse::invalid_parameters(format!("bad port '{port_raw}'"))
                })?;
                if port == 0 {
                    return Err(TrackerResponse::invalid_parameters(
                        "port must be in 1..65535",
                    ));
                }
                Self::Register { peer_id, port }
            }
            "HEARTBEAT" => Self::Heartbeat {
                peer_id: required(parts.next(), "HEARTBEAT needs <peerId>")?,
            },
            "DEREGISTER" => Self::Deregister {
                peer_id: required(parts.next(), "DEREGISTER needs <peerId>")?,
            },
            "DISCOVER" => Self::Discover,
            "IS_PEER_ALIVE" => Self::IsPeerAlive {
                peer_id: required(parts.next(), "IS_PEER_ALIVE needs <peerId>")?,
            },
            "" => {
                return Err(TrackerResponse::Error {
                    code: "UNKNOWN_COMMAND".into(),
                    message: "empty request".into(),
                })
            }
            other => {
                return Err(TrackerResponse::Error {
                    code: "UNKNOWN_COMMAND".into(),
                    message: format!("unrecognized command '{other}'"),
                })
            }
        };

        if parts.next().is_some() {
            return Err(TrackerResponse::invalid_parameters(format!(
                "trailing arguments after {verb}"
            )));
        }
        Ok(command)
    }
}

fn required(part: Option<&str>, usage: &str) -> Result<String, TrackerResponse> {
    match part {
        Some(p) if !p.is_empty() => Ok(p.to_string()),
        _ => Err(TrackerResponse::invalid_parameters(usage)),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A peer as the tracker advertises it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPeer {
    pub peer_id: String,
    /// Host observed on the registering connection.
    pub address: String,
    /// The file-transfer port the peer announced.
    pub port: u16,
}

impl TrackedPeer {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A tracker response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerResponse {
    Registered(String),
    HeartbeatAck,
    Deregistered(String),
    Peers(Vec<TrackedPeer>),
    Alive,
    NotAlive,
    Error { code: String, message: String },
}

impl TrackerResponse {
    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::Error {
            code: "INVALID_PARAMETERS".into(),
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Error {
            code: "INTERNAL_ERROR".into(),
            message: message.into(),
        }
    }

    pub fn registration_failed(message: impl Into<String>) -> Self {
        Self::Error {
            code: "REGISTRATION_FAILED".into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TrackerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered(peer_id) => write!(f, "REGISTERED {peer_id}"),
            Self::HeartbeatAck => write!(f, "HEARTBEAT_ACK"),
            Self::Deregistered(peer_id) => write!(f, "DEREGISTERED {peer_id}"),
            Self::Peers(peers) => {
                write!(f, "PEERS [")?;
                for (i, peer) in peers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}@{}", peer.peer_id, peer.endpoint())?;
                }
                write!(f, "]")
            }
            Self::Alive => write!(f, "ALIVE"),
            Self::NotAlive => write!(f, "NOT_ALIVE"),
            Self::Error { code, message } => write!(f, "ERROR {code} {message}"),
        }
    }
}
