//! # Gossip Transport
//!
//! The network engine of the epidemic: a TCP listener for inbound frames,
//! an outbound priority queue, and the propagation rule that ties them
//! together. The transport owns the peer roster and the dedupe cache; the
//! registry plugs in as a [`MessageHandler`] and never touches a socket.
//!
//! ## Propagation rule
//!
//! For every frame read off a connection:
//!
//! 1. Drop if the message id is already in the dedupe cache.
//! 2. Drop if the message has outlived its TTL.
//! 3. Record the id, deliver to the handler.
//! 4. If the hop budget allows, re-enqueue a hop-incremented copy; the
//!    outbound pump fans it out to peers not yet in the visited set.
//!
//! ## Outbound ordering
//!
//! One logical priority queue, HIGH > NORMAL > LOW. HIGH messages skip the
//! small batching delay the pump applies to the lower classes. Under
//! saturation, every `OUTBOUND_BURST` higher-class sends yield one slot to
//! a lower class so LOW traffic is delayed, not starved.
//!
//! Per-peer failures update metrics and quarantine; they never abort the
//! rest of a fanout.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::config::{now_ms, validate_peer_addr, GossipConfig, DEDUPE_CACHE_CAPACITY};
use crate::error::{Result, ShoalError};
use crate::gossip::dedupe::DedupeCache;
use crate::gossip::message::{GossipMessage, MessagePriority};
use crate::gossip::roster::PeerRoster;
use crate::gossip::wire;

/// Higher-class sends between forced lower-class slots.
const OUTBOUND_BURST: u32 = 16;

/// Batching delay applied to NORMAL/LOW drains.
const BATCH_DELAY_MS: u64 = 20;

/// Depth of each per-peer send queue before messages are shed.
const PER_PEER_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Receives each first-seen gossip message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `from` is the socket address the frame arrived on; the logical
    /// origin is `msg.sender_id`.
    async fn on_message(&self, msg: GossipMessage, from: &str);
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Transport counters, updated lock-free on the hot paths.
#[derive(Default)]
pub struct GossipStats {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_expired: AtomicU64,
    pub send_failures: AtomicU64,
    pub compressed_bytes_saved: AtomicU64,
}

/// Point-in-time view of the transport counters.
#[derive(Debug, Clone, Serialize)]
pub struct GossipStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub forwarded: u64,
    pub dropped_duplicate: u64,
    pub dropped_expired: u64,
    pub send_failures: u64,
    pub compressed_bytes_saved: u64,
    pub pending: usize,
    pub active_peers: usize,
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

struct QueueInner {
    high: VecDeque<GossipMessage>,
    normal: VecDeque<GossipMessage>,
    low: VecDeque<GossipMessage>,
    /// Consecutive high/normal pops since a lower class last got a slot.
    burst: u32,
}

/// The single outbound priority queue.
struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                burst: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, msg: GossipMessage) {
        {
            let mut inner = self.inner.lock();
            match msg.priority {
                MessagePriority::High => inner.high.push_back(msg),
                MessagePriority::Normal => inner.normal.push_back(msg),
                MessagePriority::Low => inner.low.push_back(msg),
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<GossipMessage> {
        let mut inner = self.inner.lock();

        // Starvation valve: after a sustained burst of higher-priority
        // sends, hand one slot to the best waiting lower-class message.
        if inner.burst >= OUTBOUND_BURST {
            if let Some(msg) = inner.normal.pop_front().or_else(|| inner.low.pop_front()) {
                inner.burst = 0;
                return Some(msg);
            }
        }

        if let Some(msg) = inner.high.pop_front() {
            inner.burst += 1;
            return Some(msg);
        }
        if let Some(msg) = inner.normal.pop_front() {
            inner.burst += 1;
            return Some(msg);
        }
        inner.burst = 0;
        inner.low.pop_front()
    }

    fn has_high(&self) -> bool {
        !self.inner.lock().high.is_empty()
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.high.len() + inner.normal.len() + inner.low.len()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Framed gossip send/receive over TCP.
pub struct GossipTransport {
    config: GossipConfig,
    /// Advertised `host:port`; the transport's identity in visited sets.
    self_addr: RwLock<String>,
    roster: PeerRoster,
    dedupe: DedupeCache,
    queue: OutboundQueue,
    stats: GossipStats,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    /// One ordered send queue per target peer. Fanout sends to the same
    /// peer leave in enqueue order; distinct peers proceed in parallel.
    senders: DashMap<String, mpsc::Sender<GossipMessage>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    shutdown_rx: Mutex<Option<watch::Receiver<bool>>>,
    /// Back-reference for task spawning from `&self` methods.
    weak: Weak<GossipTransport>,
}

impl GossipTransport {
    pub fn new(config: GossipConfig) -> Arc<Self> {
        let self_addr = format!("{}:{}", config.advertise_host, config.port);
        let transport = Arc::new_cyclic(|weak| Self {
            config,
            self_addr: RwLock::new(self_addr),
            roster: PeerRoster::new(),
            dedupe: DedupeCache::new(DEDUPE_CACHE_CAPACITY),
            queue: OutboundQueue::new(),
            stats: GossipStats::default(),
            handler: RwLock::new(None),
            senders: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            shutdown_rx: Mutex::new(None),
            weak: weak.clone(),
        });
        for peer in &transport.config.bootstrap_peers {
            transport.roster.add_peer(peer);
        }
        transport
    }

    /// Strong handle to self. Infallible while any caller holds `&self`,
    /// since a live borrow implies a live `Arc`.
    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("transport dropped while borrowed")
    }

    /// The advertised `host:port` identity of this transport.
    pub fn self_addr(&self) -> String {
        self.self_addr.read().clone()
    }

    /// Registers the delivery callback. Must happen before `start` for no
    /// message to be missed; a handler-less transport still forwards.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn add_peer(&self, addr: &str) -> Result<()> {
        validate_peer_addr(addr)?;
        if addr == self.self_addr() {
            return Ok(()); // gossiping to yourself is cheap but pointless
        }
        self.roster.add_peer(addr);
        Ok(())
    }

    pub fn remove_peer(&self, addr: &str) {
        self.roster.remove_peer(addr);
    }

    pub fn peers(&self) -> Vec<String> {
        self.roster.addrs()
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GossipStatsSnapshot {
        GossipStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            dropped_duplicate: self.stats.dropped_duplicate.load(Ordering::Relaxed),
            dropped_expired: self.stats.dropped_expired.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            compressed_bytes_saved: self.stats.compressed_bytes_saved.load(Ordering::Relaxed),
            pending: self.queue.len(),
            active_peers: self.roster.healthy_count(),
        }
    }

    /// Binds the listener and spawns the accept loop and outbound pump.
    ///
    /// Returns the bound socket address; with `config.port = 0` this is
    /// how callers learn the ephemeral port. Idempotent: a second start on
    /// a running transport returns an `AlreadyExists` error.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ShoalError::AlreadyExists(
                "gossip transport already started".into(),
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let local = listener.local_addr()?;
        *self.self_addr.write() =
            format!("{}:{}", self.config.advertise_host, local.port());

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        *self.shutdown_rx.lock() = Some(rx.clone());

        info!(addr = %self.self_addr(), "gossip transport listening");

        let accept_self = self.arc();
        let mut accept_shutdown = rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_self = Arc::clone(&accept_self);
                            let conn_shutdown = accept_shutdown.clone();
                            tokio::spawn(async move {
                                conn_self.handle_connection(stream, peer, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "gossip accept failed");
                        }
                    }
                }
            }
            debug!("gossip accept loop stopped");
        });

        let pump_self = self.arc();
        let mut pump_shutdown = rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.changed() => break,
                    _ = pump_self.queue.notify.notified() => {}
                }
                // HIGH drains immediately; lower classes absorb a short
                // batching delay so bursts coalesce into fewer wakeups.
                if !pump_self.queue.has_high() {
                    tokio::time::sleep(Duration::from_millis(BATCH_DELAY_MS)).await;
                }
                while let Some(msg) = pump_self.queue.pop() {
                    pump_self.dispatch(msg);
                }
            }
            debug!("gossip outbound pump stopped");
        });

        Ok(local)
    }

    /// Signals every loop and per-peer sender to stop. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        *self.shutdown_rx.lock() = None;
        // Dropping the senders closes each per-peer channel; the drain
        // tasks exit on their own.
        self.senders.clear();
        info!(addr = %self.self_addr(), "gossip transport stopped");
    }

    /// Enqueues a message for fanout delivery at its own priority and
    /// returns immediately.
    pub fn broadcast(&self, msg: GossipMessage) {
        // Our own broadcasts are "seen": a copy echoed back by a neighbor
        // must not be re-delivered or re-forwarded.
        self.dedupe.insert(&msg.message_id, msg.ttl_ms);
        self.queue.push(msg);
    }

    /// Best-effort framed send to one peer: connect, write, flush, within
    /// the configured deadline. Updates that peer's metrics either way.
    pub async fn send_to(&self, addr: &str, msg: &GossipMessage) -> Result<()> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.send_timeout_ms);

        let attempt = async {
            let mut stream = TcpStream::connect(addr).await?;
            let frame = wire::write_frame(&mut stream, msg).await?;
            stream.shutdown().await?;
            Ok::<_, ShoalError>(frame)
        };

        let outcome = match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ShoalError::Timeout(format!(
                "gossip send to {addr} exceeded {}ms",
                self.config.send_timeout_ms
            ))),
        };

        match outcome {
            Ok(frame) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .compressed_bytes_saved
                    .fetch_add(frame.saved_bytes, Ordering::Relaxed);
                self.roster
                    .record_success(addr, started.elapsed().as_millis() as u64);
                trace!(addr, kind = msg.payload.kind(), "gossip frame sent");
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                self.roster.record_failure(addr);
                debug!(addr, error = %e, "gossip send failed");
                Err(e)
            }
        }
    }

    /// Fans one message out to the selected peers. Each peer has its own
    /// ordered send queue, so one slow or dead peer never delays the
    /// others, and two messages to the same peer leave in order.
    fn dispatch(&self, msg: GossipMessage) {
        let fanout = self
            .roster
            .effective_fanout(self.config.fanout, self.config.adaptive_fanout);
        if fanout == 0 {
            debug!(kind = msg.payload.kind(), "no healthy peers, message not forwarded");
            return;
        }

        let targets = self.roster.select_fanout(fanout, &msg.visited_peers);
        trace!(
            kind = msg.payload.kind(),
            targets = targets.len(),
            hop = msg.hop_count,
            "dispatching gossip message"
        );
        for target in targets {
            self.enqueue_send(&target, msg.clone());
        }
    }

    /// Routes a message onto `target`'s ordered send queue, lazily
    /// spawning the per-peer drain task. A full queue sheds the message
    /// and charges a send failure; a wedged peer must not grow memory.
    fn enqueue_send(&self, target: &str, msg: GossipMessage) {
        let tx = self
            .senders
            .entry(target.to_string())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::channel::<GossipMessage>(PER_PEER_QUEUE_DEPTH);
                let me = self.arc();
                let peer = target.to_string();
                let shutdown = self.shutdown_rx.lock().clone();
                tokio::spawn(async move {
                    let mut shutdown = shutdown;
                    loop {
                        let next = match &mut shutdown {
                            Some(rx_shutdown) => tokio::select! {
                                _ = rx_shutdown.changed() => None,
                                next = rx.recv() => next,
                            },
                            None => rx.recv().await,
                        };
                        let Some(msg) = next else { break };
                        let _ = me.send_to(&peer, &msg).await;
                    }
                    debug!(peer, "per-peer sender stopped");
                });
                tx
            })
            .clone();

        if tx.try_send(msg).is_err() {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            self.roster.record_failure(target);
            debug!(target, "per-peer send queue full, message shed");
        }
    }

    /// Reads frames off one inbound connection until EOF or shutdown.
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = wire::read_frame(&mut stream) => frame,
            };
            match frame {
                Ok(Some(msg)) => self.handle_frame(msg, &peer.to_string()).await,
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "dropping gossip connection");
                    break;
                }
            }
        }
    }

    /// The propagation rule (see module docs).
    async fn handle_frame(&self, msg: GossipMessage, from: &str) {
        if self.dedupe.contains(&msg.message_id) {
            self.stats.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            trace!(id = %msg.message_id, "duplicate gossip message dropped");
            return;
        }
        if msg.is_expired(now_ms()) {
            self.stats.dropped_expired.fetch_add(1, Ordering::Relaxed);
            trace!(id = %msg.message_id, "expired gossip message dropped");
            return;
        }

        self.dedupe.insert(&msg.message_id, msg.ttl_ms);
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        if self.roster.contains(&msg.sender_id) {
            self.roster.mark_seen(&msg.sender_id);
        }

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_message(msg.clone(), from).await;
        }

        if msg.can_propagate() {
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            self.queue.push(msg.increment_hop(&self.self_addr()));
        }
    }
}
