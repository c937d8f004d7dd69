//! # Conflict Resolution
//!
//! When two peers write the same `(type, id)` identity concurrently, the
//! vector clocks cannot order the writes and somebody has to pick a
//! winner. The resolver is that somebody. Every policy is a deterministic
//! pure function of its inputs: any two peers handed the same candidate
//! set pick the same winner, which is what lets the registry converge
//! without coordination.
//!
//! `resolve` only ever returns an element of its input. It never merges
//! fields into a synthetic instance; `merge_metadata` exists separately
//! for callers that want a combined attribute view.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ShoalError;
use crate::registry::clock::ClockOrdering;
use crate::registry::instance::ServiceInstance;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Which rule decides between concurrent writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictPolicy {
    /// Maximum version wins; ties broken by origin peer id.
    #[default]
    LastWriteWins,
    /// The causally dominant instance wins; concurrent pairs fall back to
    /// last-write-wins.
    VectorClock,
    /// Highest configured origin priority wins; ties fall back to
    /// last-write-wins.
    OriginPriority,
    /// Healthy instances win over unhealthy ones; within the surviving
    /// set, last-write-wins.
    HealthPriority,
    /// Health filter, then origin priority, then vector clock, then
    /// last-write-wins.
    Composite,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = ShoalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LAST_WRITE_WINS" => Ok(Self::LastWriteWins),
            "VECTOR_CLOCK" => Ok(Self::VectorClock),
            "ORIGIN_PRIORITY" => Ok(Self::OriginPriority),
            "HEALTH_PRIORITY" => Ok(Self::HealthPriority),
            "COMPOSITE" => Ok(Self::Composite),
            other => Err(ShoalError::InvalidArgument(format!(
                "unknown conflict policy '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LastWriteWins => "LAST_WRITE_WINS",
            Self::VectorClock => "VECTOR_CLOCK",
            Self::OriginPriority => "ORIGIN_PRIORITY",
            Self::HealthPriority => "HEALTH_PRIORITY",
            Self::Composite => "COMPOSITE",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Deterministic winner selection among conflicting instances.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    origin_priorities: HashMap<String, i32>,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            origin_priorities: HashMap::new(),
        }
    }

    /// Configures per-origin priorities for the origin-aware policies.
    /// Unlisted origins rank at 0.
    pub fn with_origin_priorities(
        mut self,
        priorities: impl IntoIterator<Item = (String, i32)>,
    ) -> Self {
        self.origin_priorities = priorities.into_iter().collect();
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Picks the winner among `candidates` under the configured policy.
    ///
    /// Returns `None` only for an empty slice. The result is always one of
    /// the inputs, and the same inputs always produce the same winner
    /// regardless of their order in the slice.
    pub fn resolve<'a>(&self, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let refs: Vec<&'a ServiceInstance> = candidates.iter().collect();
        match refs.as_slice() {
            [] => None,
            [only] => Some(*only),
            all => Some(match self.policy {
                ConflictPolicy::LastWriteWins => last_write_wins(all),
                ConflictPolicy::VectorClock => {
                    clock_dominant(all).unwrap_or_else(|| last_write_wins(all))
                }
                ConflictPolicy::OriginPriority => {
                    last_write_wins(&self.top_origin_priority(all))
                }
                ConflictPolicy::HealthPriority => last_write_wins(&healthy_subset(all)),
                ConflictPolicy::Composite => {
                    let healthy = healthy_subset(all);
                    let preferred = self.top_origin_priority(&healthy);
                    clock_dominant(&preferred).unwrap_or_else(|| last_write_wins(&preferred))
                }
            }),
        }
    }

    /// True iff the two instances describe the same identity with
    /// divergent replicated state.
    pub fn is_conflict(&self, a: &ServiceInstance, b: &ServiceInstance) -> bool {
        a.conflicts_with(b)
    }

    /// Unions metadata across candidates. For duplicate keys the value
    /// from the instance with the greater version wins (ties broken by
    /// origin peer id), matching the last-write-wins intuition per key.
    pub fn merge_metadata(&self, candidates: &[ServiceInstance]) -> BTreeMap<String, String> {
        let mut ranked: Vec<&ServiceInstance> = candidates.iter().collect();
        // Ascending, so later (newer) inserts overwrite earlier ones.
        ranked.sort_by(|a, b| {
            (a.version, a.origin_peer_id.as_str()).cmp(&(b.version, b.origin_peer_id.as_str()))
        });

        let mut merged = BTreeMap::new();
        for instance in ranked {
            for (k, v) in &instance.metadata {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// The subset whose origin priority equals the maximum present.
    fn top_origin_priority<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Vec<&'a ServiceInstance> {
        let best = candidates
            .iter()
            .map(|c| self.origin_priority(c))
            .max()
            .unwrap_or(0);
        candidates
            .iter()
            .copied()
            .filter(|c| self.origin_priority(c) == best)
            .collect()
    }

    fn origin_priority(&self, instance: &ServiceInstance) -> i32 {
        self.origin_priorities
            .get(&instance.origin_peer_id)
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Policy building blocks
// ---------------------------------------------------------------------------

/// Healthy candidates, or all of them if none are healthy. Never returns
/// an empty set for a non-empty input, so downstream rules always have
/// something to choose from.
fn healthy_subset<'a>(candidates: &[&'a ServiceInstance]) -> Vec<&'a ServiceInstance> {
    let healthy: Vec<&ServiceInstance> =
        candidates.iter().copied().filter(|c| c.healthy).collect();
    if healthy.is_empty() {
        candidates.to_vec()
    } else {
        healthy
    }
}

/// Maximum by `(version, origin_peer_id, host, port)`. The trailing fields
/// only matter for pathological duplicates, but they keep the choice total.
fn last_write_wins<'a>(candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            (a.version, a.origin_peer_id.as_str(), a.host.as_str(), a.port)
                .cmp(&(b.version, b.origin_peer_id.as_str(), b.host.as_str(), b.port))
        })
        .expect("last_write_wins called with empty candidate set")
}

/// The unique candidate whose clock is `After` every other, if one exists.
fn clock_dominant<'a>(candidates: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
    'outer: for candidate in candidates {
        for other in candidates {
            if std::ptr::eq(*candidate, *other) {
                continue;
            }
            match candidate.vector_clock.compare(&other.vector_clock) {
                ClockOrdering::After => {}
                _ => continue 'outer,
            }
        }
        return Some(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn instance(origin: &str, version: u64, healthy: bool) -> ServiceInstance {
        let mut i = ServiceInstance::new(
            "web",
            "svc1",
            &format!("host-{origin}"),
            8080,
            BTreeMap::new(),
            origin,
        )
        .unwrap();
        i.version = version;
        i.healthy = healthy;
        i
    }

    #[test]
    fn empty_list_resolves_to_none() {
        let resolver = ConflictResolver::new(ConflictPolicy::LastWriteWins);
        assert!(resolver.resolve(&[]).is_none());
    }

    #[test]
    fn single_candidate_wins_trivially() {
        let resolver = ConflictResolver::new(ConflictPolicy::Composite);
        let a = instance("p1", 100, true);
        let winner = resolver.resolve(std::slice::from_ref(&a)).unwrap();
        assert_eq!(winner, &a);
    }

    #[test]
    fn last_write_wins_by_version_then_origin() {
        let resolver = ConflictResolver::new(ConflictPolicy::LastWriteWins);
        let a = instance("pa", 100, true);
        let b = instance("pb", 200, true);
        assert_eq!(resolver.resolve(&[a.clone(), b.clone()]).unwrap(), &b);

        let c = instance("pc", 200, true);
        // Tied version, "pc" > "pb" lexicographically.
        assert_eq!(resolver.resolve(&[b.clone(), c.clone()]).unwrap(), &c);
    }

    #[test]
    fn vector_clock_picks_dominant_else_lww() {
        let resolver = ConflictResolver::new(ConflictPolicy::VectorClock);

        let a = instance("p1", 500, true);
        let mut b = a.clone();
        b.vector_clock = a.vector_clock.increment("p1").unwrap();
        b.version = 100; // older by version, newer by causality
        b.host = "host-b".into();

        // Causal dominance beats version.
        assert_eq!(resolver.resolve(&[a.clone(), b.clone()]).unwrap(), &b);

        // Concurrent clocks: falls through to LWW.
        let mut c = a.clone();
        c.vector_clock = a.vector_clock.increment("p2").unwrap();
        c.version = 50;
        let mut d = a.clone();
        d.vector_clock = a.vector_clock.increment("p3").unwrap();
        d.version = 60;
        assert_eq!(resolver.resolve(&[c.clone(), d.clone()]).unwrap(), &d);
    }

    #[test]
    fn origin_priority_prefers_configured_origin() {
        let resolver = ConflictResolver::new(ConflictPolicy::OriginPriority)
            .with_origin_priorities([("pa".to_string(), 10)]);

        let a = instance("pa", 100, true);
        let b = instance("pb", 900, true);
        // pa is configured above pb despite the older version.
        assert_eq!(resolver.resolve(&[a.clone(), b.clone()]).unwrap(), &a);

        // With no priorities configured, everyone ties at 0 and LWW applies.
        let resolver = ConflictResolver::new(ConflictPolicy::OriginPriority);
        assert_eq!(resolver.resolve(&[a, b.clone()]).unwrap(), &b);
    }

    #[test]
    fn health_priority_filters_then_lww() {
        let resolver = ConflictResolver::new(ConflictPolicy::HealthPriority);

        let sick_new = instance("pa", 900, false);
        let well_old = instance("pb", 100, true);
        assert_eq!(
            resolver.resolve(&[sick_new.clone(), well_old.clone()]).unwrap(),
            &well_old
        );

        // All unhealthy: LWW over the full set.
        let sick_old = instance("pc", 50, false);
        assert_eq!(
            resolver.resolve(&[sick_new.clone(), sick_old]).unwrap(),
            &sick_new
        );
    }

    #[test]
    fn composite_runs_the_full_gauntlet() {
        let resolver = ConflictResolver::new(ConflictPolicy::Composite)
            .with_origin_priorities([("pa".to_string(), 5), ("pb".to_string(), 5)]);

        let sick = instance("pz", 999, false);
        let a = instance("pa", 100, true);
        let b = instance("pb", 200, true);

        // Health filter drops pz; pa/pb tie on priority; clocks concurrent
        // (independent origins); LWW picks pb.
        let candidates = [sick, a, b.clone()];
        let winner = resolver.resolve(&candidates).unwrap();
        assert_eq!(winner, &b);
    }

    #[test]
    fn resolution_is_order_independent() {
        let resolver = ConflictResolver::new(ConflictPolicy::Composite);
        let a = instance("pa", 100, true);
        let b = instance("pb", 200, false);
        let c = instance("pc", 300, true);

        let w1 = resolver.resolve(&[a.clone(), b.clone(), c.clone()]).unwrap().clone();
        let w2 = resolver.resolve(&[c, a, b]).unwrap().clone();
        assert_eq!(w1, w2);
    }

    #[test]
    fn merge_metadata_newer_version_wins_per_key() {
        let resolver = ConflictResolver::new(ConflictPolicy::LastWriteWins);

        let mut a = instance("pa", 100, true);
        a.metadata.insert("region".into(), "us".into());
        a.metadata.insert("rack".into(), "r1".into());

        let mut b = instance("pb", 200, true);
        b.metadata.insert("region".into(), "eu".into());
        b.metadata.insert("zone".into(), "z2".into());

        let merged = resolver.merge_metadata(&[a, b]);
        assert_eq!(merged.get("region").unwrap(), "eu"); // newer version won
        assert_eq!(merged.get("rack").unwrap(), "r1"); // union keeps both
        assert_eq!(merged.get("zone").unwrap(), "z2");
    }

    #[test]
    fn policy_parses_from_config_strings() {
        use std::str::FromStr;
        assert_eq!(
            ConflictPolicy::from_str("LAST_WRITE_WINS").unwrap(),
            ConflictPolicy::LastWriteWins
        );
        assert_eq!(
            ConflictPolicy::from_str("composite").unwrap(),
            ConflictPolicy::Composite
        );
        assert!(ConflictPolicy::from_str("NEWEST_WINS").is_err());
    }
}
