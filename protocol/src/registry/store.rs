//! # Distributed Registry
//!
//! The replicated `(service_type, service_id) → ServiceInstance` map every
//! peer carries. Local mutations bump the peer's vector clock and go out
//! as HIGH-priority gossip; remote updates come back in through the
//! [`MessageHandler`] seam and pass through one idempotent apply rule:
//!
//! - absent identity → insert
//! - stored clock dominates → drop
//! - incoming clock dominates → replace
//! - concurrent or equal → the conflict resolver picks, deterministically
//!
//! Deregistrations travel as tombstones that win the same rule, and a
//! retained tombstone window keeps a late, stale `SERVICE_REGISTER` from
//! resurrecting an identity that was deliberately removed.
//!
//! A periodic anti-entropy round pushes the full snapshot (tombstones
//! included) to a few random peers, repairing whatever the epidemic
//! missed. The registry is purely in-memory: restart means rejoin.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::{now_ms, AntiEntropyConfig, GossipConfig, TOMBSTONE_TTL_MS};
use crate::gossip::message::{
    GossipMessage, GossipPayload, MessagePriority, RegistrySnapshot,
};
use crate::gossip::transport::{GossipTransport, MessageHandler};
use crate::registry::clock::ClockOrdering;
use crate::registry::instance::ServiceInstance;
use crate::registry::resolver::ConflictResolver;

/// Identity key: `(service_type, service_id)`.
type Identity = (String, String);

/// Everything the apply path mutates, under one lock so applies are
/// serialized and the tombstone check can never race an insert.
struct State {
    services: HashMap<String, HashMap<String, ServiceInstance>>,
    /// Tombstones retained to suppress resurrection, with expiry times.
    tombstones: HashMap<Identity, (ServiceInstance, u64)>,
}

/// Snapshot of the registry's statistics counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub peer_id: String,
    pub running: bool,
    pub registry_version: u64,
    pub service_types: usize,
    pub total_services: usize,
    pub known_peers: usize,
}

/// The gossip-replicated service registry.
pub struct DistributedRegistry {
    peer_id: String,
    resolver: ConflictResolver,
    transport: Arc<GossipTransport>,
    gossip_cfg: GossipConfig,
    ae_cfg: AntiEntropyConfig,
    state: RwLock<State>,
    registry_version: AtomicU64,
    running: AtomicBool,
    shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
    weak: Weak<DistributedRegistry>,
}

impl DistributedRegistry {
    pub fn new(
        peer_id: &str,
        resolver: ConflictResolver,
        transport: Arc<GossipTransport>,
        gossip_cfg: GossipConfig,
        ae_cfg: AntiEntropyConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            peer_id: peer_id.to_string(),
            resolver,
            transport,
            gossip_cfg,
            ae_cfg,
            state: RwLock::new(State {
                services: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            registry_version: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: parking_lot::Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("registry dropped while borrowed")
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn registry_version(&self) -> u64 {
        self.registry_version.load(Ordering::Acquire)
    }

    /// Hooks into the transport and spawns the maintenance loop
    /// (owned-instance heartbeats + anti-entropy rounds). Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        self.transport.set_handler(self.arc());

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        // Join sync: ask a few peers for their snapshot right away instead
        // of waiting out the first anti-entropy interval.
        let joiner = self.arc();
        tokio::spawn(async move {
            joiner.request_sync(&[]).await;
        });

        let me = self.arc();
        let hb_every = Duration::from_millis(me.gossip_cfg.interval_ms.max(100));
        let ae_every = Duration::from_millis(me.ae_cfg.interval_ms.max(100));
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(hb_every);
            let mut anti_entropy = tokio::time::interval(ae_every);
            // The first tick of a tokio interval fires immediately; skip it
            // so a freshly started registry does not gossip an empty map.
            heartbeat.tick().await;
            anti_entropy.tick().await;
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = heartbeat.tick() => me.heartbeat_round(),
                    _ = anti_entropy.tick() => me.anti_entropy_round(),
                }
            }
            debug!(peer = %me.peer_id, "registry maintenance loop stopped");
        });

        info!(peer = %self.peer_id, "distributed registry started");
    }

    /// Stops the maintenance loop. Idempotent; the local map survives
    /// until the process exits (there is nothing to persist).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        info!(peer = %self.peer_id, "distributed registry stopped");
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Registers a service owned by this peer and gossips it at HIGH
    /// priority.
    ///
    /// Returns `false` (and logs) on invalid input, or when a
    /// strictly-newer entry for the identity already exists. Benign
    /// failure is not an error here: callers race against gossip all the
    /// time and the registry must stay calm about it.
    pub fn register_service(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> bool {
        let candidate = match ServiceInstance::new(
            service_type,
            service_id,
            host,
            port,
            metadata,
            &self.peer_id,
        ) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, service_type, service_id, "register rejected");
                return false;
            }
        };

        let outgoing = {
            let mut state = self.state.write();
            let identity = candidate.identity();

            let mut candidate = candidate;
            if let Some(existing) = state
                .services
                .get(service_type)
                .and_then(|by_id| by_id.get(service_id))
            {
                if existing.is_newer_than(&candidate) {
                    warn!(
                        service_type,
                        service_id,
                        existing_version = existing.version,
                        "register lost to a newer existing entry"
                    );
                    return false;
                }
                // Supersede our previous registration causally.
                candidate.version = now_ms().max(existing.version + 1);
                match existing.vector_clock.merge(&candidate.vector_clock).increment(&self.peer_id)
                {
                    Ok(clock) => candidate.vector_clock = clock,
                    Err(e) => {
                        warn!(error = %e, "register failed to advance clock");
                        return false;
                    }
                }
            }

            // A deliberate local register beats any tombstone we hold.
            if let Some((stone, _)) = state.tombstones.remove(&identity) {
                candidate.version = candidate.version.max(stone.version + 1);
                if let Ok(clock) = stone
                    .vector_clock
                    .merge(&candidate.vector_clock)
                    .increment(&self.peer_id)
                {
                    candidate.vector_clock = clock;
                }
            }

            state
                .services
                .entry(service_type.to_string())
                .or_default()
                .insert(service_id.to_string(), candidate.clone());
            self.bump_version();
            candidate
        };

        info!(instance = %outgoing, "service registered");
        self.gossip(GossipPayload::ServiceRegister(outgoing), MessagePriority::High);
        true
    }

    /// Removes a local entry and gossips its tombstone at HIGH priority.
    pub fn deregister_service(&self, service_type: &str, service_id: &str) -> bool {
        let stone = {
            let mut state = self.state.write();
            let Some(existing) = state
                .services
                .get_mut(service_type)
                .and_then(|by_id| by_id.remove(service_id))
            else {
                warn!(service_type, service_id, "deregister of unknown service");
                return false;
            };
            if let Some(by_id) = state.services.get(service_type) {
                if by_id.is_empty() {
                    state.services.remove(service_type);
                }
            }

            let stone = match existing.tombstone(&self.peer_id) {
                Ok(stone) => stone,
                Err(e) => {
                    warn!(error = %e, "tombstone construction failed");
                    return false;
                }
            };
            state
                .tombstones
                .insert(stone.identity(), (stone.clone(), now_ms() + TOMBSTONE_TTL_MS));
            self.bump_version();
            stone
        };

        info!(service_type, service_id, "service deregistered");
        self.gossip(GossipPayload::ServiceDeregister(stone), MessagePriority::High);
        true
    }

    /// Snapshot of all instances under `service_type`, in no particular
    /// order.
    pub fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.state
            .read()
            .services
            .get(service_type)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_service(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        self.state
            .read()
            .services
            .get(service_type)
            .and_then(|by_id| by_id.get(service_id))
            .cloned()
    }

    /// Flips the health flag on a local entry and gossips the update at
    /// NORMAL priority.
    pub fn update_service_health(
        &self,
        service_type: &str,
        service_id: &str,
        healthy: bool,
    ) -> bool {
        let updated = {
            let mut state = self.state.write();
            let Some(existing) = state
                .services
                .get_mut(service_type)
                .and_then(|by_id| by_id.get_mut(service_id))
            else {
                warn!(service_type, service_id, "health update for unknown service");
                return false;
            };
            let updated = match existing.with_health(&self.peer_id, healthy) {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(error = %e, "health update failed to advance clock");
                    return false;
                }
            };
            *existing = updated.clone();
            self.bump_version();
            updated
        };

        debug!(instance = %updated, healthy, "service health updated");
        self.gossip(GossipPayload::ServiceUpdate(updated), MessagePriority::Normal);
        true
    }

    /// Deep-copy snapshot of the live map.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let mut snapshot = RegistrySnapshot::new();
        for (service_type, by_id) in &state.services {
            snapshot.insert(
                service_type.clone(),
                by_id
                    .iter()
                    .map(|(id, instance)| (id.clone(), instance.clone()))
                    .collect(),
            );
        }
        snapshot
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let state = self.state.read();
        RegistryStatistics {
            peer_id: self.peer_id.clone(),
            running: self.is_running(),
            registry_version: self.registry_version(),
            service_types: state.services.len(),
            total_services: state.services.values().map(HashMap::len).sum(),
            known_peers: self.transport.peers().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Apply path
    // -----------------------------------------------------------------------

    /// Applies one replicated instance (live or tombstone) under the
    /// causal rule. Returns whether local state changed. Idempotent:
    /// re-applying any update is a no-op.
    fn apply(&self, incoming: &ServiceInstance) -> bool {
        let is_stone = incoming.is_tombstone();
        let identity = incoming.identity();
        let mut state = self.state.write();

        // Tombstone gate: a removed identity only comes back through an
        // update that causally supersedes (or out-resolves) the removal.
        if !is_stone {
            if let Some((stone, _)) = state.tombstones.get(&identity) {
                let revived = match incoming.vector_clock.compare(&stone.vector_clock) {
                    ClockOrdering::After => true,
                    ClockOrdering::Before | ClockOrdering::Equal => false,
                    ClockOrdering::Concurrent => {
                        let candidates = [stone.clone(), incoming.clone()];
                        self.resolver.resolve(&candidates) == Some(&candidates[1])
                    }
                };
                if !revived {
                    trace!(?identity, "update suppressed by tombstone");
                    return false;
                }
                state.tombstones.remove(&identity);
            }
        }

        let existing = state
            .services
            .get(&incoming.service_type)
            .and_then(|by_id| by_id.get(&incoming.service_id))
            .cloned();

        let wins = match &existing {
            None => true,
            Some(existing) => match existing.vector_clock.compare(&incoming.vector_clock) {
                ClockOrdering::After => false,
                ClockOrdering::Before => true,
                ClockOrdering::Equal | ClockOrdering::Concurrent => {
                    let candidates = [existing.clone(), incoming.clone()];
                    let winner = self.resolver.resolve(&candidates);
                    winner == Some(&candidates[1]) && existing != incoming
                }
            },
        };
        if !wins {
            return false;
        }

        if is_stone {
            let removed = state
                .services
                .get_mut(&incoming.service_type)
                .and_then(|by_id| by_id.remove(&incoming.service_id))
                .is_some();
            if let Some(by_id) = state.services.get(&incoming.service_type) {
                if by_id.is_empty() {
                    state.services.remove(&incoming.service_type);
                }
            }
            let fresh = state
                .tombstones
                .insert(identity.clone(), (incoming.clone(), now_ms() + TOMBSTONE_TTL_MS))
                .is_none();
            if removed || fresh {
                self.bump_version();
                trace!(?identity, "tombstone applied");
                return true;
            }
            return false;
        }

        state
            .services
            .entry(incoming.service_type.clone())
            .or_default()
            .insert(incoming.service_id.clone(), incoming.clone());
        self.bump_version();
        trace!(instance = %incoming, "replicated instance applied");
        true
    }

    fn apply_snapshot(&self, snapshot: &RegistrySnapshot) -> usize {
        let mut applied = 0;
        for by_id in snapshot.values() {
            for instance in by_id.values() {
                if self.apply(instance) {
                    applied += 1;
                }
            }
        }
        applied
    }

    fn bump_version(&self) {
        self.registry_version.fetch_add(1, Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Gossip emission
    // -----------------------------------------------------------------------

    fn gossip(&self, payload: GossipPayload, priority: MessagePriority) {
        let msg = GossipMessage::new(
            &self.transport.self_addr(),
            payload,
            priority,
            self.gossip_cfg.max_hops,
            self.gossip_cfg.message_ttl_ms,
        );
        // Enqueue only; the apply path never waits on a socket.
        self.transport.broadcast(msg);
    }

    /// Replication view: live entries plus retained tombstones, so
    /// anti-entropy also repairs missed deregistrations.
    fn replication_snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let mut snapshot = RegistrySnapshot::new();
        for (service_type, by_id) in &state.services {
            snapshot.insert(
                service_type.clone(),
                by_id
                    .iter()
                    .map(|(id, instance)| (id.clone(), instance.clone()))
                    .collect(),
            );
        }
        for ((service_type, service_id), (stone, _)) in &state.tombstones {
            snapshot
                .entry(service_type.clone())
                .or_default()
                .insert(service_id.clone(), stone.clone());
        }
        snapshot
    }

    /// Sends a `SYNC_REQUEST` to a few random roster peers, optionally
    /// filtered to the given service types. Their `SYNC_RESPONSE`s come
    /// back through the normal apply path.
    pub async fn request_sync(&self, service_types: &[&str]) {
        let peers = self.transport.roster().random_peers(self.ae_cfg.peers);
        if peers.is_empty() {
            return;
        }
        let requested_types: std::collections::BTreeSet<String> =
            service_types.iter().map(|t| t.to_string()).collect();
        debug!(peers = peers.len(), "requesting sync");

        for peer in peers {
            let msg = GossipMessage::new(
                &self.transport.self_addr(),
                GossipPayload::SyncRequest {
                    requested_types: requested_types.clone(),
                },
                MessagePriority::Normal,
                1,
                self.gossip_cfg.message_ttl_ms,
            );
            let _ = self.transport.send_to(&peer, &msg).await;
        }
    }

    /// Re-gossips proof-of-life for locally owned healthy instances.
    /// Instances this peer marked unhealthy stay quiet: a heartbeat
    /// forces the health flag on at every receiver.
    fn heartbeat_round(&self) {
        let owned: Vec<ServiceInstance> = {
            let state = self.state.read();
            state
                .services
                .values()
                .flat_map(|by_id| by_id.values())
                .filter(|instance| instance.origin_peer_id == self.peer_id && instance.healthy)
                .cloned()
                .collect()
        };
        for instance in owned {
            self.gossip(GossipPayload::Heartbeat(instance), MessagePriority::Normal);
        }
    }

    /// Pushes the replication snapshot to a few random peers and sweeps
    /// expired tombstones.
    fn anti_entropy_round(&self) {
        {
            let mut state = self.state.write();
            let now = now_ms();
            state.tombstones.retain(|_, (_, expires)| *expires > now);
        }

        let peers = self.transport.roster().random_peers(self.ae_cfg.peers);
        if peers.is_empty() {
            return;
        }
        let snapshot = self.replication_snapshot();
        debug!(peers = peers.len(), entries = snapshot.len(), "anti-entropy round");

        for peer in peers {
            let msg = GossipMessage::new(
                &self.transport.self_addr(),
                GossipPayload::AntiEntropy {
                    snapshot: snapshot.clone(),
                },
                MessagePriority::Low,
                1, // direct push; receivers apply but do not re-gossip it
                self.gossip_cfg.message_ttl_ms,
            );
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let _ = transport.send_to(&peer, &msg).await;
            });
        }
    }
}

#[async_trait]
impl MessageHandler for DistributedRegistry {
    async fn on_message(&self, msg: GossipMessage, from: &str) {
        trace!(kind = msg.payload.kind(), from, "registry received gossip");
        match msg.payload {
            GossipPayload::ServiceRegister(ref instance)
            | GossipPayload::ServiceUpdate(ref instance) => {
                self.apply(instance);
            }
            GossipPayload::Heartbeat(ref instance) => {
                let mut alive = instance.clone();
                alive.healthy = true;
                self.apply(&alive);
            }
            GossipPayload::ServiceDeregister(ref stone) => {
                self.apply(stone);
            }
            GossipPayload::SyncRequest { requested_types } => {
                let mut snapshot = self.replication_snapshot();
                if !requested_types.is_empty() {
                    snapshot.retain(|service_type, _| requested_types.contains(service_type));
                }
                let reply = GossipMessage::new(
                    &self.transport.self_addr(),
                    GossipPayload::SyncResponse {
                        snapshot,
                        sync_version: self.registry_version(),
                    },
                    MessagePriority::Normal,
                    1,
                    self.gossip_cfg.message_ttl_ms,
                );
                let transport = Arc::clone(&self.transport);
                let requester = msg.sender_id.clone();
                tokio::spawn(async move {
                    let _ = transport.send_to(&requester, &reply).await;
                });
            }
            GossipPayload::SyncResponse { ref snapshot, .. }
            | GossipPayload::AntiEntropy { ref snapshot } => {
                let applied = self.apply_snapshot(snapshot);
                if applied > 0 {
                    debug!(applied, "snapshot reconciliation applied entries");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::resolver::ConflictPolicy;

    fn registry_with_policy(peer_id: &str, policy: ConflictPolicy) -> Arc<DistributedRegistry> {
        let transport = GossipTransport::new(GossipConfig {
            port: 0,
            ..GossipConfig::default()
        });
        DistributedRegistry::new(
            peer_id,
            ConflictResolver::new(policy),
            transport,
            GossipConfig::default(),
            AntiEntropyConfig::default(),
        )
    }

    fn registry(peer_id: &str) -> Arc<DistributedRegistry> {
        registry_with_policy(peer_id, ConflictPolicy::LastWriteWins)
    }

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn register_and_discover() {
        let reg = registry("p1");
        assert!(reg.register_service("web", "svc1", "10.0.0.1", 8080, meta()));

        let found = reg.discover_services("web");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "10.0.0.1");
        assert_eq!(found[0].origin_peer_id, "p1");
        assert!(reg.get_service("web", "svc1").is_some());
        assert!(reg.get_service("web", "nope").is_none());
        assert_eq!(reg.registry_version(), 1);
    }

    #[test]
    fn register_rejects_invalid_input() {
        let reg = registry("p1");
        assert!(!reg.register_service("", "svc1", "h", 80, meta()));
        assert!(!reg.register_service("web", "", "h", 80, meta()));
        assert!(!reg.register_service("web", "svc1", "", 80, meta()));
        assert!(!reg.register_service("web", "svc1", "h", 0, meta()));
        assert_eq!(reg.registry_version(), 0);
    }

    #[test]
    fn reregister_supersedes_previous_version() {
        let reg = registry("p1");
        assert!(reg.register_service("web", "svc1", "10.0.0.1", 8080, meta()));
        let first = reg.get_service("web", "svc1").unwrap();

        assert!(reg.register_service("web", "svc1", "10.0.0.2", 9090, meta()));
        let second = reg.get_service("web", "svc1").unwrap();

        assert_eq!(second.host, "10.0.0.2");
        assert!(second.is_newer_than(&first));
        assert!(first.vector_clock.happens_before(&second.vector_clock));
        assert_eq!(reg.discover_services("web").len(), 1);
    }

    #[test]
    fn deregister_removes_and_tombstones() {
        let reg = registry("p1");
        assert!(reg.register_service("web", "svc1", "10.0.0.1", 8080, meta()));
        let live = reg.get_service("web", "svc1").unwrap();

        assert!(reg.deregister_service("web", "svc1"));
        assert!(reg.get_service("web", "svc1").is_none());
        assert!(reg.discover_services("web").is_empty());

        // A replay of the original registration must not resurrect it.
        assert!(!reg.apply(&live));
        assert!(reg.get_service("web", "svc1").is_none());

        // Deregistering twice fails benignly.
        assert!(!reg.deregister_service("web", "svc1"));
    }

    #[test]
    fn register_after_own_deregister_wins_over_tombstone() {
        let reg = registry("p1");
        assert!(reg.register_service("web", "svc1", "10.0.0.1", 8080, meta()));
        assert!(reg.deregister_service("web", "svc1"));
        assert!(reg.register_service("web", "svc1", "10.0.0.3", 8081, meta()));

        let revived = reg.get_service("web", "svc1").unwrap();
        assert_eq!(revived.host, "10.0.0.3");
    }

    #[test]
    fn apply_inserts_new_remote_instance() {
        let reg = registry("p1");
        let remote =
            ServiceInstance::new("web", "svc1", "10.0.0.9", 8080, meta(), "p2").unwrap();
        assert!(reg.apply(&remote));
        assert_eq!(reg.get_service("web", "svc1").unwrap().host, "10.0.0.9");

        // Idempotent: same update applies once.
        assert!(!reg.apply(&remote));
        assert_eq!(reg.registry_version(), 1);
    }

    #[test]
    fn apply_never_replaces_with_causally_older() {
        let reg = registry("p1");
        let v1 = ServiceInstance::new("web", "svc1", "10.0.0.1", 8080, meta(), "p2").unwrap();
        let v2 = v1.successor("p2").unwrap();

        assert!(reg.apply(&v2));
        // The older write arrives late and is dropped.
        assert!(!reg.apply(&v1));
        assert_eq!(
            reg.get_service("web", "svc1").unwrap().vector_clock,
            v2.vector_clock
        );
    }

    #[test]
    fn apply_resolves_concurrent_writes_deterministically() {
        let reg_x = registry("x");
        let reg_y = registry("y");

        let mut from_x = ServiceInstance::new("web", "svc1", "hx", 8080, meta(), "x").unwrap();
        let mut from_y = ServiceInstance::new("web", "svc1", "hy", 8080, meta(), "y").unwrap();
        from_x.version = 100;
        from_y.version = 200;

        // Both sides see both writes, in opposite orders.
        assert!(reg_x.apply(&from_x));
        reg_x.apply(&from_y);
        assert!(reg_y.apply(&from_y));
        reg_y.apply(&from_x);

        let at_x = reg_x.get_service("web", "svc1").unwrap();
        let at_y = reg_y.get_service("web", "svc1").unwrap();
        assert_eq!(at_x, at_y, "replicas diverged under concurrent writes");
        assert_eq!(at_x.host, "hy", "LWW should pick the higher version");
    }

    #[test]
    fn composite_policy_prefers_healthy_side() {
        let reg = registry_with_policy("z", ConflictPolicy::Composite);

        let mut sick = ServiceInstance::new("web", "svc1", "hy", 8080, meta(), "y").unwrap();
        sick.version = 900;
        sick.healthy = false;
        let mut well = ServiceInstance::new("web", "svc1", "hx", 8080, meta(), "x").unwrap();
        well.version = 100;

        assert!(reg.apply(&sick));
        assert!(reg.apply(&well), "healthy instance should replace sick one");
        assert_eq!(reg.get_service("web", "svc1").unwrap().host, "hx");
    }

    #[test]
    fn heartbeat_marks_healthy() {
        let reg = registry("p1");
        let mut instance =
            ServiceInstance::new("web", "svc1", "10.0.0.9", 8080, meta(), "p2").unwrap();
        instance.healthy = false;
        assert!(reg.apply(&instance));
        assert!(!reg.get_service("web", "svc1").unwrap().healthy);

        // Heartbeat application path forces the flag on; the clock is
        // unchanged so this rides the resolver branch.
        let mut alive = instance.clone();
        alive.healthy = true;
        reg.apply(&alive);
        assert!(reg.get_service("web", "svc1").unwrap().healthy);
    }

    #[test]
    fn update_health_bumps_version_and_clock() {
        let reg = registry("p1");
        assert!(reg.register_service("web", "svc1", "10.0.0.1", 8080, meta()));
        let before = reg.get_service("web", "svc1").unwrap();

        assert!(reg.update_service_health("web", "svc1", false));
        let after = reg.get_service("web", "svc1").unwrap();
        assert!(!after.healthy);
        assert!(before.vector_clock.happens_before(&after.vector_clock));

        assert!(!reg.update_service_health("web", "missing", false));
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let reg = registry("p1");
        reg.register_service("web", "svc1", "10.0.0.1", 8080, meta());
        let snapshot = reg.snapshot();

        reg.deregister_service("web", "svc1");
        // The snapshot still holds the entry.
        assert!(snapshot.get("web").unwrap().contains_key("svc1"));
        assert!(reg.discover_services("web").is_empty());
    }

    #[test]
    fn replication_snapshot_carries_tombstones() {
        let reg = registry("p1");
        reg.register_service("web", "svc1", "10.0.0.1", 8080, meta());
        reg.deregister_service("web", "svc1");

        let replication = reg.replication_snapshot();
        let entry = replication.get("web").unwrap().get("svc1").unwrap();
        assert!(entry.is_tombstone());

        // The public snapshot stays clean.
        assert!(reg.snapshot().get("web").is_none());
    }

    #[test]
    fn snapshot_apply_converges_two_registries() {
        let reg_a = registry("a");
        let reg_b = registry("b");

        reg_a.register_service("web", "svc1", "ha", 8080, meta());
        reg_b.register_service("db", "svc2", "hb", 5432, meta());

        reg_b.apply_snapshot(&reg_a.replication_snapshot());
        reg_a.apply_snapshot(&reg_b.replication_snapshot());

        assert_eq!(reg_a.snapshot(), reg_b.snapshot());
        assert_eq!(reg_a.discover_services("web").len(), 1);
        assert_eq!(reg_a.discover_services("db").len(), 1);
    }

    #[test]
    fn statistics_reflect_state() {
        let reg = registry("p1");
        reg.register_service("web", "svc1", "h", 8080, meta());
        reg.register_service("web", "svc2", "h", 8081, meta());
        reg.register_service("db", "svc3", "h", 5432, meta());

        let stats = reg.statistics();
        assert_eq!(stats.peer_id, "p1");
        assert!(!stats.running);
        assert_eq!(stats.service_types, 2);
        assert_eq!(stats.total_services, 3);
        assert_eq!(stats.registry_version, 3);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let reg = registry("p1");
        reg.start();
        reg.start();
        assert!(reg.is_running());
        reg.stop();
        reg.stop();
        assert!(!reg.is_running());
    }
}
