//! # Tracker Server
//!
//! The liveness control plane: a TCP line-protocol server that records
//! which peers exist, when each was last heard from, and answers
//! discovery queries. The tracker holds no replicated state of its own;
//! it is the cheap, centralized complement to the gossip registry, and it
//! registers itself *into* that registry so peers can find trackers the
//! same way they find everything else.
//!
//! A peer is alive iff `now − last_seen < peer_timeout_ms`. Exactly at
//! the boundary counts as dead; a peer that stopped heartbeating gets no
//! benefit of the doubt.
//!
//! Failure containment: malformed commands answer `ERROR ...` and keep
//! the connection; I/O errors close that one connection; nothing a client
//! sends can take down the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{now_ms, TrackerConfig, SERVICE_TYPE_TRACKER, SUBSTRATE_VERSION};
use crate::error::{Result, ShoalError};
use crate::registry::ServiceDirectory;
use crate::tracker::protocol::{TrackedPeer, TrackerCommand, TrackerResponse};
use crate::workers::{PoolKind, WorkerPool, WorkerPools};

/// How long tracker shutdown waits for in-flight connections to drain.
const POOL_DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Both liveness maps under one mutex: REGISTER/DEREGISTER must mutate
/// them together, and readers must never observe one without the other.
#[derive(Default)]
struct Liveness {
    peers: HashMap<String, TrackedPeer>,
    last_seen: HashMap<String, u64>,
}

/// The tracker control-plane server.
pub struct TrackerServer {
    config: TrackerConfig,
    liveness: Mutex<Liveness>,
    directory: Option<Arc<dyn ServiceDirectory>>,
    /// Connection handlers run on a fixed pool of `config.pool_size`
    /// workers; excess connections queue rather than spawning unbounded.
    pools: WorkerPools,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    bound_port: Mutex<u16>,
    weak: Weak<TrackerServer>,
}

impl TrackerServer {
    /// Creates a tracker. Pass a [`ServiceDirectory`] to have the tracker
    /// announce itself under the `"tracker"` service type on start.
    pub fn new(
        config: TrackerConfig,
        directory: Option<Arc<dyn ServiceDirectory>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            liveness: Mutex::new(Liveness::default()),
            directory,
            pools: WorkerPools::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            bound_port: Mutex::new(0),
            weak: weak.clone(),
        })
    }

    fn connection_pool(&self) -> Arc<WorkerPool> {
        self.pools.get_or_create(
            "tracker-connections",
            PoolKind::Fixed(self.config.pool_size.max(1)),
        )
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("tracker dropped while borrowed")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The port actually bound (resolves ephemeral binds).
    pub fn port(&self) -> u16 {
        *self.bound_port.lock()
    }

    /// Binds the listener, spawns the accept loop and the expiry sweep,
    /// and announces this tracker in the registry when one is wired.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ShoalError::AlreadyExists("tracker already started".into()));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let local = listener.local_addr()?;
        *self.bound_port.lock() = local.port();

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        info!(addr = %local, timeout_ms = self.config.peer_timeout_ms, "tracker listening");

        if let Some(directory) = &self.directory {
            let mut metadata = std::collections::BTreeMap::new();
            metadata.insert("version".to_string(), SUBSTRATE_VERSION.to_string());
            let registered = directory.register(
                SERVICE_TYPE_TRACKER,
                &format!("tracker-{}", local.port()),
                &self.config.advertise_host,
                local.port(),
                metadata,
            );
            if !registered {
                warn!("tracker failed to self-register in the service registry");
            }
        }

        let accept_self = self.arc();
        let pool = self.connection_pool();
        let mut accept_shutdown = rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_self = accept_self.arc();
                            let conn_shutdown = accept_shutdown.clone();
                            let submitted = pool.submit(async move {
                                if let Err(e) =
                                    conn_self.serve_connection(stream, peer, conn_shutdown).await
                                {
                                    debug!(peer = %peer, error = %e, "tracker connection closed");
                                }
                                Ok(())
                            });
                            if let Err(e) = submitted {
                                warn!(peer = %peer, error = %e, "connection rejected, pool saturated");
                            }
                        }
                        Err(e) => warn!(error = %e, "tracker accept failed"),
                    }
                }
            }
            debug!("tracker accept loop stopped");
        });

        // Expiry sweep: entries idle past the timeout are removed so the
        // DISCOVER list does not accumulate ghosts. Liveness answers stay
        // correct either way; this is hygiene, not correctness.
        let sweep_self = self.arc();
        let mut sweep_shutdown = rx;
        let sweep_every =
            std::time::Duration::from_millis((self.config.peer_timeout_ms / 3).max(100));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = sweep_shutdown.changed() => break,
                    _ = tick.tick() => sweep_self.sweep_expired(),
                }
            }
        });

        Ok(local)
    }

    /// Stops accepting, drains the connection pool in the background, and
    /// deregisters from the registry. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(directory) = &self.directory {
            directory.deregister(SERVICE_TYPE_TRACKER, &format!("tracker-{}", self.port()));
        }
        let me = self.arc();
        tokio::spawn(async move {
            me.pools.shutdown_all(POOL_DRAIN_DEADLINE).await;
        });
        info!("tracker stopped");
    }

    // -----------------------------------------------------------------------
    // State queries (also used directly by tests and the node binary)
    // -----------------------------------------------------------------------

    /// Liveness rule: strictly inside the timeout window.
    pub fn is_peer_alive(&self, peer_id: &str) -> bool {
        let liveness = self.liveness.lock();
        match liveness.last_seen.get(peer_id) {
            Some(&seen) => now_ms().saturating_sub(seen) < self.config.peer_timeout_ms,
            None => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.liveness.lock().peers.len()
    }

    pub fn peers(&self) -> Vec<TrackedPeer> {
        self.liveness.lock().peers.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Command handling
    // -----------------------------------------------------------------------

    fn handle_command(&self, command: TrackerCommand, remote: &SocketAddr) -> TrackerResponse {
        match command {
            TrackerCommand::Register { peer_id, port } => {
                let peer = TrackedPeer {
                    peer_id: peer_id.clone(),
                    address: remote.ip().to_string(),
                    port,
                };
                let mut liveness = self.liveness.lock();
                liveness.peers.insert(peer_id.clone(), peer);
                liveness.last_seen.insert(peer_id.clone(), now_ms());
                drop(liveness);
                info!(peer_id, port, from = %remote, "peer registered");
                TrackerResponse::Registered(peer_id)
            }
            TrackerCommand::Heartbeat { peer_id } => {
                let mut liveness = self.liveness.lock();
                liveness.last_seen.insert(peer_id, now_ms());
                TrackerResponse::HeartbeatAck
            }
            TrackerCommand::Deregister { peer_id } => {
                let mut liveness = self.liveness.lock();
                let known = liveness.peers.remove(&peer_id).is_some();
                liveness.last_seen.remove(&peer_id);
                drop(liveness);
                if known {
                    info!(peer_id, "peer deregistered");
                    TrackerResponse::Deregistered(peer_id)
                } else {
                    TrackerResponse::Error {
                        code: "NOT_FOUND".into(),
                        message: format!("unknown peer '{peer_id}'"),
                    }
                }
            }
            TrackerCommand::Discover => TrackerResponse::Peers(self.peers()),
            TrackerCommand::IsPeerAlive { peer_id } => {
                if self.is_peer_alive(&peer_id) {
                    TrackerResponse::Alive
                } else {
                    TrackerResponse::NotAlive
                }
            }
        }
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = tokio::select! {
                _ = shutdown.changed() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };

            let response = match TrackerCommand::parse(&line) {
                Ok(command) => self.handle_command(command, &remote),
                Err(error_response) => {
                    debug!(from = %remote, line, "malformed tracker command");
                    error_response
                }
            };

            write_half
                .write_all(format!("{response}\n").as_bytes())
                .await?;
        }
        Ok(())
    }

    fn sweep_expired(&self) {
        let now = now_ms();
        let timeout = self.config.peer_timeout_ms;
        let mut liveness = self.liveness.lock();
        let dead: Vec<String> = liveness
            .last_seen
            .iter()
            .filter(|(_, &seen)| now.saturating_sub(seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in dead {
            liveness.peers.remove(&peer_id);
            liveness.last_seen.remove(&peer_id);
            debug!(peer_id, "expired peer swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(timeout_ms: u64) -> Arc<TrackerServer> {
        TrackerServer::new(
            TrackerConfig {
                port: 0,
                peer_timeout_ms: timeout_ms,
                ..TrackerConfig::default()
            },
            None,
        )
    }

    fn remote() -> SocketAddr {
        "10.1.2.3:55555".parse().unwrap()
    }

    #[test]
    fn register_then_discover_and_alive() {
        let tracker = server(90_000);
        let response = tracker.handle_command(
            TrackerCommand::Register {
                peer_id: "peerA".into(),
                port: 7001,
            },
            &remote(),
        );
        assert_eq!(response, TrackerResponse::Registered("peerA".into()));

        let peers = tracker.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, "10.1.2.3");
        assert_eq!(peers[0].port, 7001);

        assert!(tracker.is_peer_alive("peerA"));
        assert!(!tracker.is_peer_alive("stranger"));
    }

    #[test]
    fn heartbeat_refreshes_last_seen_only() {
        let tracker = server(90_000);
        tracker.handle_command(
            TrackerCommand::Register {
                peer_id: "peerA".into(),
                port: 7001,
            },
            &remote(),
        );
        let before = *tracker.liveness.lock().last_seen.get("peerA").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let ack = tracker.handle_command(
            TrackerCommand::Heartbeat {
                peer_id: "peerA".into(),
            },
            &remote(),
        );
        assert_eq!(ack, TrackerResponse::HeartbeatAck);

        let after = *tracker.liveness.lock().last_seen.get("peerA").unwrap();
        assert!(after > before);
        assert_eq!(tracker.peer_count(), 1);
    }

    #[test]
    fn deregister_removes_both_maps_atomically() {
        let tracker = server(90_000);
        tracker.handle_command(
            TrackerCommand::Register {
                peer_id: "peerA".into(),
                port: 7001,
            },
            &remote(),
        );

        let response = tracker.handle_command(
            TrackerCommand::Deregister {
                peer_id: "peerA".into(),
            },
            &remote(),
        );
        assert_eq!(response, TrackerResponse::Deregistered("peerA".into()));
        assert_eq!(tracker.peer_count(), 0);
        assert!(!tracker.is_peer_alive("peerA"));

        // Unknown peer: error, no state change.
        let response = tracker.handle_command(
            TrackerCommand::Deregister {
                peer_id: "peerA".into(),
            },
            &remote(),
        );
        assert!(matches!(response, TrackerResponse::Error { .. }));
    }

    #[test]
    fn liveness_boundary_is_strict() {
        let tracker = server(50);
        tracker.handle_command(
            TrackerCommand::Register {
                peer_id: "peerB".into(),
                port: 7001,
            },
            &remote(),
        );
        assert!(tracker.is_peer_alive("peerB"));

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(!tracker.is_peer_alive("peerB"));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let tracker = server(30);
        tracker.handle_command(
            TrackerCommand::Register {
                peer_id: "peerC".into(),
                port: 7001,
            },
            &remote(),
        );
        std::thread::sleep(std::time::Duration::from_millis(40));
        tracker.sweep_expired();
        assert_eq!(tracker.peer_count(), 0);
    }

    #[tokio::test]
    async fn start_stop_idempotence() {
        let tracker = server(90_000);
        let addr = tracker.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(tracker.is_running());
        assert!(matches!(
            tracker.start().await,
            Err(ShoalError::AlreadyExists(_))
        ));
        tracker.stop();
        tracker.stop();
        assert!(!tracker.is_running());
    }
}
