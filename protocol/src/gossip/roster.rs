//! # Peer Roster
//!
//! Who we gossip with, and how much we trust each of them. Every peer
//! address carries running metrics: send successes and failures, a
//! latency estimate, and a consecutive-failure streak. The streak drives
//! quarantine: a peer that fails five sends in a row is benched for a
//! backoff window that doubles each time it happens again, so a dead host
//! costs one timeout per window instead of one per message.
//!
//! Fanout selection is weighted random over the healthy roster (not
//! quarantined, failure streak under threshold, heard from within the
//! liveness window), favoring reliable peers without starving the rest.
//! Anti-entropy deliberately samples the whole roster instead, so benched
//! and stale peers still get repaired and can earn their way back in.

use std::collections::BTreeSet;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;

use crate::config::{
    now_ms, QUARANTINE_BASE_BACKOFF_MS, QUARANTINE_MAX_BACKOFF_MS, QUARANTINE_THRESHOLD,
    ROSTER_LIVENESS_WINDOW_MS,
};

/// Weight floor so zero-history peers still get selected occasionally.
const MIN_SELECTION_WEIGHT: f64 = 0.05;

/// EWMA factor for the latency estimate.
const LATENCY_ALPHA: f64 = 0.2;

// ---------------------------------------------------------------------------
// Per-peer metrics
// ---------------------------------------------------------------------------

/// Running delivery metrics for one roster peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub last_seen_ms: u64,
    /// Non-zero while quarantined: the release timestamp.
    pub quarantined_until_ms: u64,
    /// Current quarantine window; doubles per re-quarantine up to the cap.
    pub backoff_ms: u64,
}

impl PeerMetrics {
    fn new(now: u64) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            // A fresh peer starts inside the liveness window; it has not
            // had the chance to disappoint us yet.
            last_seen_ms: now,
            quarantined_until_ms: 0,
            backoff_ms: QUARANTINE_BASE_BACKOFF_MS,
        }
    }

    /// Delivery success ratio in [0, 1], damped by an active failure
    /// streak so a recently flaky peer ranks below its historical average.
    pub fn reliability(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        let base = if total == 0 {
            0.5 // unknown peer: neutral prior
        } else {
            self.success_count as f64 / total as f64
        };
        base / (1.0 + self.consecutive_failures as f64)
    }

    pub fn is_quarantined(&self, now: u64) -> bool {
        self.quarantined_until_ms > now
    }

    /// Healthy: failure streak under threshold and heard from recently.
    pub fn is_healthy(&self, now: u64) -> bool {
        self.consecutive_failures < QUARANTINE_THRESHOLD
            && now.saturating_sub(self.last_seen_ms) < ROSTER_LIVENESS_WINDOW_MS
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Concurrent peer set with per-peer metrics.
#[derive(Default)]
pub struct PeerRoster {
    peers: DashMap<String, PeerMetrics>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addr` to the roster. Idempotent; existing metrics survive.
    pub fn add_peer(&self, addr: &str) {
        self.peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerMetrics::new(now_ms()));
    }

    pub fn remove_peer(&self, addr: &str) {
        self.peers.remove(addr);
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All roster addresses.
    pub fn addrs(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Metrics snapshot for one peer.
    pub fn metrics(&self, addr: &str) -> Option<PeerMetrics> {
        self.peers.get(addr).map(|e| e.value().clone())
    }

    /// Records a successful send: resets the failure streak and the
    /// quarantine window, folds the observed latency into the estimate.
    pub fn record_success(&self, addr: &str, latency_ms: u64) {
        let now = now_ms();
        let mut entry = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerMetrics::new(now));
        let m = entry.value_mut();
        m.success_count += 1;
        m.consecutive_failures = 0;
        m.quarantined_until_ms = 0;
        m.backoff_ms = QUARANTINE_BASE_BACKOFF_MS;
        m.last_seen_ms = now;
        m.avg_latency_ms = if m.success_count == 1 {
            latency_ms as f64
        } else {
            m.avg_latency_ms * (1.0 - LATENCY_ALPHA) + latency_ms as f64 * LATENCY_ALPHA
        };
    }

    /// Records a failed send. Crossing the streak threshold quarantines
    /// the peer and doubles its next window.
    pub fn record_failure(&self, addr: &str) {
        let now = now_ms();
        let mut entry = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerMetrics::new(now));
        let m = entry.value_mut();
        m.failure_count += 1;
        m.consecutive_failures += 1;
        if m.consecutive_failures >= QUARANTINE_THRESHOLD && !m.is_quarantined(now) {
            m.quarantined_until_ms = now + m.backoff_ms;
            m.backoff_ms = (m.backoff_ms * 2).min(QUARANTINE_MAX_BACKOFF_MS);
        }
    }

    /// Marks a peer as heard-from without a send (inbound traffic).
    pub fn mark_seen(&self, addr: &str) {
        let now = now_ms();
        let mut entry = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerMetrics::new(now));
        entry.value_mut().last_seen_ms = now;
    }

    /// Number of currently healthy peers.
    pub fn healthy_count(&self) -> usize {
        let now = now_ms();
        self.peers.iter().filter(|e| e.value().is_healthy(now)).count()
    }

    /// Effective fanout for the current roster.
    ///
    /// Adaptive mode scales with the healthy population:
    /// `clamp(ceil(F₀ · log2(max(N, 2))), 1, N)`. Fixed mode is simply
    /// `min(F₀, N)`.
    pub fn effective_fanout(&self, base: usize, adaptive: bool) -> usize {
        let n = self.healthy_count();
        if n == 0 {
            return 0;
        }
        if adaptive {
            let scaled = (base as f64 * (n.max(2) as f64).log2()).ceil() as usize;
            scaled.clamp(1, n)
        } else {
            base.min(n)
        }
    }

    /// Picks up to `count` distinct peers, weighted by reliability,
    /// excluding everything in `exclude`.
    ///
    /// The candidate pool is the same healthy population that sizes the
    /// fanout: quarantined or stale peers are skipped here exactly as
    /// they are uncounted in [`healthy_count`](Self::healthy_count).
    /// Stale peers are not lost to the epidemic; anti-entropy reaches
    /// them through [`random_peers`](Self::random_peers), and one
    /// successful push makes them selectable again.
    pub fn select_fanout(&self, count: usize, exclude: &BTreeSet<String>) -> Vec<String> {
        let now = now_ms();
        let mut candidates: Vec<(String, f64)> = self
            .peers
            .iter()
            .filter(|e| !exclude.contains(e.key()))
            .filter(|e| !e.value().is_quarantined(now) && e.value().is_healthy(now))
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().reliability().max(MIN_SELECTION_WEIGHT),
                )
            })
            .collect();

        let mut rng = rand::thread_rng();
        let mut selected = Vec::with_capacity(count.min(candidates.len()));
        while selected.len() < count && !candidates.is_empty() {
            let total: f64 = candidates.iter().map(|(_, w)| w).sum();
            let mut roll = rng.gen_range(0.0..total);
            let mut picked = candidates.len() - 1;
            for (i, (_, w)) in candidates.iter().enumerate() {
                if roll < *w {
                    picked = i;
                    break;
                }
                roll -= w;
            }
            selected.push(candidates.swap_remove(picked).0);
        }
        selected
    }

    /// Uniformly random sample of up to `count` peers, quarantine
    /// included. Anti-entropy uses this: the whole point of the repair
    /// path is reaching peers regular gossip has given up on.
    pub fn random_peers(&self, count: usize) -> Vec<String> {
        use rand::seq::SliceRandom;
        let mut addrs = self.addrs();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(count);
        addrs
    }
}
