//! # Peer Runtime
//!
//! The top-level runtime for a file-sharing peer. Owns the transfer
//! listener, the shared-file set, and the relationship with the tracker
//! and the registry. Startup is a sequential chain with a well-defined
//! state machine:
//!
//! ```text
//! Created → Starting → Registered → Running → Stopping → Stopped
//! ```
//!
//! 1. bind the transfer listener and start the accept loop
//! 2. announce in the distributed registry under type `"peer"`
//! 3. register with the tracker (retry + circuit breaker)
//! 4. start the heartbeat worker
//! 5. release the startup latch
//!
//! A failure in any step cancels the rest and drives the machine through
//! `Stopping` to `Stopped`; no half-started peer lingers. Tracker calls
//! run through a named resilience pipeline, so a dead tracker costs
//! bounded retries and then fail-fasts while the circuit is open.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{now_ms, PeerConfig, SERVICE_TYPE_PEER, SUBSTRATE_VERSION};
use crate::error::{Result, ShoalError};
use crate::peer::files::SharedFiles;
use crate::peer::transfer;
use crate::registry::ServiceDirectory;
use crate::resilience::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::pipeline::ResiliencePipeline;
use crate::resilience::retry::RetryPolicy;
use crate::tracker::client::TrackerClient;

/// Lifecycle states of a peer runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    Created,
    Starting,
    Registered,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Registered => "REGISTERED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// A running (or startable) file-sharing peer.
pub struct PeerRuntime {
    peer_id: String,
    config: PeerConfig,
    tracker: TrackerClient,
    files: Arc<SharedFiles>,
    directory: Option<Arc<dyn ServiceDirectory>>,
    state: RwLock<PeerState>,
    /// Startup latch: flips to `true` exactly once, at the end of the chain.
    ready: watch::Sender<bool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    bound_port: Mutex<u16>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    weak: Weak<PeerRuntime>,
}

impl PeerRuntime {
    /// Creates a peer with default resilience settings.
    pub fn new(
        peer_id: &str,
        config: PeerConfig,
        tracker_addr: &str,
        files: Arc<SharedFiles>,
        directory: Option<Arc<dyn ServiceDirectory>>,
    ) -> Arc<Self> {
        Self::with_resilience(
            peer_id,
            config,
            tracker_addr,
            files,
            directory,
            RetryPolicy::default(),
            CircuitBreakerConfig::default(),
        )
    }

    /// Creates a peer with explicit retry and breaker tuning.
    pub fn with_resilience(
        peer_id: &str,
        config: PeerConfig,
        tracker_addr: &str,
        files: Arc<SharedFiles>,
        directory: Option<Arc<dyn ServiceDirectory>>,
        retry_policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
    ) -> Arc<Self> {
        let tracker = TrackerClient::new(tracker_addr, config.socket_timeout_ms);
        let breaker = Arc::new(
            CircuitBreaker::new(format!("tracker[{tracker_addr}]"), breaker_config)
                .with_failure_predicate(ShoalError::is_retryable),
        );
        let (ready, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            peer_id: peer_id.to_string(),
            config,
            tracker,
            files,
            directory,
            state: RwLock::new(PeerState::Created),
            ready,
            shutdown: Mutex::new(None),
            bound_port: Mutex::new(0),
            breaker,
            retry_policy,
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("peer runtime dropped while borrowed")
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// The transfer port actually bound (resolves ephemeral binds).
    pub fn port(&self) -> u16 {
        *self.bound_port.lock()
    }

    pub fn files(&self) -> &SharedFiles {
        &self.files
    }

    /// Blocks until the startup latch releases.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_state(&self, next: PeerState) {
        let mut state = self.state.write();
        debug!(peer = %self.peer_id, from = %*state, to = %next, "peer state transition");
        *state = next;
    }

    fn pipeline(&self, name: &str) -> ResiliencePipeline {
        ResiliencePipeline::named(format!("{}:{}", self.peer_id, name))
            .with_breaker(Arc::clone(&self.breaker))
            .with_retry(self.retry_policy.clone())
    }

    // -----------------------------------------------------------------------
    // Startup chain
    // -----------------------------------------------------------------------

    /// Runs the startup chain. On success the peer is `Running` and the
    /// latch is released; on failure the peer is `Stopped` and the error
    /// describes the step that broke.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.state() != PeerState::Created {
            return Err(ShoalError::AlreadyExists(format!(
                "peer {} already started (state {})",
                self.peer_id,
                self.state()
            )));
        }
        self.set_state(PeerState::Starting);

        eprintln!("DBG start: begin startup chain");
        match self.run_startup_chain().await {
            Ok(addr) => {
                self.set_state(PeerState::Running);
                // Latch releases only after the state is observable.
                let _ = self.ready.send(true);
                info!(peer = %self.peer_id, addr = %addr, "peer running");
                Ok(addr)
            }
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "startup failed, rolling back");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn run_startup_chain(&self) -> Result<SocketAddr> {
        eprintln!("DBG start: binding listener");
        // Step 1: listener + accept loop.
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        eprintln!("DBG start: bound listener");
        let local = listener.local_addr()?;
        *self.bound_port.lock() = local.port();

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        self.spawn_accept_loop(listener, rx.clone());

        // Step 2: announce in the registry.
        if let Some(directory) = &self.directory {
            let registered = directory.register(
                SERVICE_TYPE_PEER,
                &self.peer_id,
                &self.config.advertise_host,
                local.port(),
                self.registry_metadata(),
            );
            if !registered {
                return Err(ShoalError::Internal(
                    "registry rejected peer registration".into(),
                ));
            }
        }

        // Step 3: register with the tracker, behind retry + breaker.
        eprintln!("DBG start: registering with tracker");
        self.pipeline("register")
            .execute(|_| self.tracker.register(&self.peer_id, self.port()))
            .await?;
        eprintln!("DBG start: registered");
        self.set_state(PeerState::Registered);

        // Step 4: heartbeat worker.
        self.spawn_heartbeat_worker(rx);

        Ok(local)
    }

    fn registry_metadata(&self) -> BTreeMap<String, String> {
        let (tracker_host, tracker_port) = self
            .tracker
            .addr()
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.to_string()))
            .unwrap_or_else(|| (self.tracker.addr().to_string(), String::new()));

        let mut metadata = BTreeMap::new();
        metadata.insert("start_time".into(), now_ms().to_string());
        metadata.insert("version".into(), SUBSTRATE_VERSION.into());
        metadata.insert("capabilities".into(), "file-transfer".into());
        metadata.insert("region".into(), self.config.region.clone());
        metadata.insert("file_count".into(), self.files.count().to_string());
        metadata.insert("tracker_host".into(), tracker_host);
        metadata.insert("tracker_port".into(), tracker_port);
        metadata
    }

    fn spawn_accept_loop(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let me = self.arc();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, remote)) => {
                            let conn = me.arc();
                            tokio::spawn(async move {
                                let deadline =
                                    Duration::from_millis(conn.config.socket_timeout_ms);
                                let served = tokio::time::timeout(
                                    deadline,
                                    transfer::serve_connection(&mut stream, &conn.files),
                                )
                                .await;
                                match served {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => {
                                        debug!(peer = %remote, error = %e, "transfer connection failed")
                                    }
                                    Err(_) => {
                                        debug!(peer = %remote, "transfer connection timed out")
                                    }
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "transfer accept failed"),
                    }
                }
            }
            debug!(peer = %me.peer_id, "transfer accept loop stopped");
        });
    }

    /// Heartbeats land at a random point in [interval/2, interval], re-
    /// rolled each cycle, so a fleet started together drifts apart
    /// instead of stampeding the tracker.
    fn spawn_heartbeat_worker(&self, mut shutdown: watch::Receiver<bool>) {
        let me = self.arc();
        tokio::spawn(async move {
            let interval_ms = me.config.heartbeat_interval_secs.saturating_mul(1000).max(2);
            loop {
                let sleep_ms = rand::thread_rng().gen_range(interval_ms / 2..=interval_ms);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                }

                let result = me
                    .pipeline("heartbeat")
                    .execute(|_| me.tracker.heartbeat(&me.peer_id))
                    .await;
                match result {
                    Ok(()) => debug!(peer = %me.peer_id, "heartbeat acked"),
                    Err(ShoalError::CircuitOpen { retry_after_ms }) => {
                        debug!(peer = %me.peer_id, retry_after_ms, "heartbeat skipped, circuit open")
                    }
                    Err(e) => warn!(peer = %me.peer_id, error = %e, "heartbeat failed"),
                }
            }
            debug!(peer = %me.peer_id, "heartbeat worker stopped");
        });
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Graceful stop: deregisters best-effort, then tears down workers.
    /// Idempotent.
    pub async fn stop(&self) {
        let current = self.state();
        if current == PeerState::Stopped || current == PeerState::Stopping {
            return;
        }
        self.set_state(PeerState::Stopping);

        // Best-effort goodbye; a dead tracker must not wedge shutdown.
        let goodbye = tokio::time::timeout(
            Duration::from_secs(2),
            self.tracker.deregister(&self.peer_id),
        )
        .await;
        if !matches!(goodbye, Ok(Ok(()))) {
            debug!(peer = %self.peer_id, "tracker deregister skipped or failed");
        }

        if let Some(directory) = &self.directory {
            directory.deregister(SERVICE_TYPE_PEER, &self.peer_id);
        }

        self.teardown().await;
        info!(peer = %self.peer_id, "peer stopped");
    }

    async fn teardown(&self) {
        self.set_state(PeerState::Stopping);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        self.set_state(PeerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::resilience::retry::BackoffStrategy;
    use crate::tracker::server::TrackerServer;
    use std::io::Write as _;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            strategy: BackoffStrategy::Fixed,
        }
    }

    async fn running_tracker(timeout_ms: u64) -> (Arc<TrackerServer>, String) {
        let tracker = TrackerServer::new(
            TrackerConfig {
                port: 0,
                peer_timeout_ms: timeout_ms,
                ..TrackerConfig::default()
            },
            None,
        );
        let addr = tracker.start().await.unwrap();
        (tracker, format!("127.0.0.1:{}", addr.port()))
    }

    fn shared_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> Arc<SharedFiles> {
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content)
            .unwrap();
        let files = Arc::new(SharedFiles::new());
        files.add(&path).unwrap();
        files
    }

    fn peer_config(heartbeat_secs: u64) -> PeerConfig {
        PeerConfig {
            port: 0,
            heartbeat_interval_secs: heartbeat_secs,
            ..PeerConfig::default()
        }
    }

    #[tokio::test]
    async fn full_lifecycle_with_tracker_and_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let files = shared_file(&dir, "x.txt", b"hello");
        let (tracker, tracker_addr) = running_tracker(90_000).await;

        let peer = PeerRuntime::with_resilience(
            "peer-1",
            peer_config(30),
            &tracker_addr,
            files,
            None,
            fast_retry(),
            CircuitBreakerConfig::default(),
        );
        assert_eq!(peer.state(), PeerState::Created);

        let addr = peer.start().await.unwrap();
        assert_eq!(peer.state(), PeerState::Running);
        peer.wait_ready().await;
        assert!(tracker.is_peer_alive("peer-1"));

        // The transfer listener is live: fetch the shared file.
        let dest = tempfile::tempdir().unwrap();
        let download = transfer::download(
            &format!("127.0.0.1:{}", addr.port()),
            "x.txt",
            dest.path(),
        )
        .await
        .unwrap();
        assert_eq!(download.size, 5);
        assert_eq!(std::fs::read(&download.path).unwrap(), b"hello");

        peer.stop().await;
        assert_eq!(peer.state(), PeerState::Stopped);
        assert_eq!(tracker.peer_count(), 0);

        tracker.stop();
    }

    #[tokio::test]
    async fn startup_fails_cleanly_without_a_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let files = shared_file(&dir, "x.txt", b"hello");

        let peer = PeerRuntime::with_resilience(
            "peer-orphan",
            peer_config(30),
            "127.0.0.1:1", // nobody home
            files,
            None,
            fast_retry(),
            CircuitBreakerConfig::default(),
        );

        let err = peer.start().await.unwrap_err();
        assert!(err.is_retryable(), "expected transient failure, got {err:?}");
        assert_eq!(peer.state(), PeerState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = shared_file(&dir, "x.txt", b"hello");
        let (tracker, tracker_addr) = running_tracker(90_000).await;

        let peer = PeerRuntime::with_resilience(
            "peer-2",
            peer_config(30),
            &tracker_addr,
            files,
            None,
            fast_retry(),
            CircuitBreakerConfig::default(),
        );
        peer.start().await.unwrap();
        assert!(matches!(
            peer.start().await,
            Err(ShoalError::AlreadyExists(_))
        ));

        peer.stop().await;
        peer.stop().await; // idempotent
        tracker.stop();
    }

    #[tokio::test]
    async fn heartbeats_keep_the_peer_alive_past_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let files = shared_file(&dir, "x.txt", b"hello");
        // Tight timeout, 1s heartbeat: liveness survives only if the
        // worker actually heartbeats.
        let (tracker, tracker_addr) = running_tracker(1_800).await;

        let peer = PeerRuntime::with_resilience(
            "peer-hb",
            peer_config(1),
            &tracker_addr,
            files,
            None,
            fast_retry(),
            CircuitBreakerConfig::default(),
        );
        peer.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert!(
            tracker.is_peer_alive("peer-hb"),
            "heartbeat worker went quiet"
        );

        peer.stop().await;
        tracker.stop();
    }
}
