//! # Tracker Client
//!
//! The peer-side half of the line protocol: one connection per call,
//! write a line, read a line, hang up. Registration and heartbeats are
//! frequent and tiny, so connection reuse buys nothing worth the
//! bookkeeping. Every call carries a deadline; a tracker that stops
//! answering turns into `Timeout` errors the resilience layer knows how
//! to classify.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{Result, ShoalError};
use crate::tracker::protocol::TrackedPeer;

/// Line-protocol client for one tracker endpoint.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    addr: String,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new(addr: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One request/response exchange under the deadline.
    async fn call(&self, request: &str) -> Result<String> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.write_all(format!("{request}\n").as_bytes()).await?;

            let (read_half, _write_half) = stream.split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await?;
            if line.is_empty() {
                return Err(ShoalError::unavailable(format!(
                    "tracker {} closed the connection",
                    self.addr
                )));
            }
            Ok::<_, ShoalError>(line.trim_end().to_string())
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ShoalError::Timeout(format!(
                    "tracker {} did not answer within {:?}",
                    self.addr, self.timeout
                ))
            })??;

        trace!(tracker = %self.addr, request, response, "tracker exchange");
        Ok(response)
    }

    /// Maps an `ERROR <code> <msg>` line onto the taxonomy.
    fn error_from(line: &str) -> ShoalError {
        let rest = line.trim_start_matches("ERROR").trim_start();
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        match code {
            "INVALID_PARAMETERS" => ShoalError::InvalidArgument(message.to_string()),
            "NOT_FOUND" => ShoalError::NotFound(message.to_string()),
            "UNKNOWN_COMMAND" => ShoalError::Protocol(message.to_string()),
            _ => ShoalError::Internal(format!("{code}: {message}")),
        }
    }

    pub async fn register(&self, peer_id: &str, port: u16) -> Result<()> {
        let response = self.call(&format!("REGISTER {peer_id} {port}")).await?;
        match response.as_str() {
            r if r == format!("REGISTERED {peer_id}") => Ok(()),
            r if r.starts_with("ERROR") => Err(Self::error_from(r)),
            other => Err(ShoalError::Protocol(format!(
                "unexpected register response '{other}'"
            ))),
        }
    }

    pub async fn heartbeat(&self, peer_id: &str) -> Result<()> {
        let response = self.call(&format!("HEARTBEAT {peer_id}")).await?;
        match response.as_str() {
            "HEARTBEAT_ACK" => Ok(()),
            r if r.starts_with("ERROR") => Err(Self::error_from(r)),
            other => Err(ShoalError::Protocol(format!(
                "unexpected heartbeat response '{other}'"
            ))),
        }
    }

    pub async fn deregister(&self, peer_id: &str) -> Result<()> {
        let response = self.call(&format!("DEREGISTER {peer_id}")).await?;
        match response.as_str() {
            r if r == format!("DEREGISTERED {peer_id}") => Ok(()),
            r if r.starts_with("ERROR") => Err(Self::error_from(r)),
            other => Err(ShoalError::Protocol(format!(
                "unexpected deregister response '{other}'"
            ))),
        }
    }

    pub async fn is_peer_alive(&self, peer_id: &str) -> Result<bool> {
        let response = self.call(&format!("IS_PEER_ALIVE {peer_id}")).await?;
        match response.as_str() {
            "ALIVE" => Ok(true),
            "NOT_ALIVE" => Ok(false),
            r if r.starts_with("ERROR") => Err(Self::error_from(r)),
            other => Err(ShoalError::Protocol(format!(
                "unexpected liveness response '{other}'"
            ))),
        }
    }

    /// Parses the `PEERS [...]` debug dump. Best effort: entries that do
    /// not match `id@host:port` are skipped. Real discovery goes through
    /// the registry; this exists for operators and tests.
    pub async fn discover(&self) -> Result<Vec<TrackedPeer>> {
        let response = self.call("DISCOVER").await?;
        let Some(list) = response
            .strip_prefix("PEERS [")
            .and_then(|r| r.strip_suffix(']'))
        else {
            if response.starts_with("ERROR") {
                return Err(Self::error_from(&response));
            }
            return Err(ShoalError::Protocol(format!(
                "unexpected discover response '{response}'"
            )));
        };

        let mut peers = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((peer_id, endpoint)) = entry.split_once('@') else {
                continue;
            };
            let Some((address, port)) = endpoint.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            peers.push(TrackedPeer {
                peer_id: peer_id.to_string(),
                address: address.to_string(),
                port,
            });
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::tracker::server::TrackerServer;

    async fn running_tracker(timeout_ms: u64) -> (std::sync::Arc<TrackerServer>, TrackerClient) {
        let tracker = TrackerServer::new(
            TrackerConfig {
                port: 0,
                peer_timeout_ms: timeout_ms,
                ..TrackerConfig::default()
            },
            None,
        );
        let addr = tracker.start().await.unwrap();
        let client = TrackerClient::new(format!("127.0.0.1:{}", addr.port()), 5_000);
        (tracker, client)
    }

    #[tokio::test]
    async fn register_heartbeat_deregister_roundtrip() {
        let (tracker, client) = running_tracker(90_000).await;

        client.register("peerA", 7001).await.unwrap();
        assert!(client.is_peer_alive("peerA").await.unwrap());

        client.heartbeat("peerA").await.unwrap();

        let peers = client.discover().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "peerA");
        assert_eq!(peers[0].port, 7001);

        client.deregister("peerA").await.unwrap();
        assert!(!client.is_peer_alive("peerA").await.unwrap());

        tracker.stop();
    }

    #[tokio::test]
    async fn deregister_unknown_maps_to_not_found() {
        let (tracker, client) = running_tracker(90_000).await;
        let err = client.deregister("ghost").await.unwrap_err();
        assert!(matches!(err, ShoalError::NotFound(_)));
        tracker.stop();
    }

    #[tokio::test]
    async fn unreachable_tracker_is_unavailable_or_timeout() {
        let client = TrackerClient::new("127.0.0.1:1", 500);
        let err = client.heartbeat("peerA").await.unwrap_err();
        assert!(err.is_retryable(), "got non-retryable {err:?}");
    }
}
