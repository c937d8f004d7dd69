//! # Registry Module
//!
//! The distributed service registry: who runs what, replicated to every
//! peer without a master. Local writes are causally stamped with vector
//! clocks and gossiped; concurrent writes are settled by a deterministic
//! conflict resolver; anti-entropy repairs whatever gossip missed.
//!
//! ```text
//! clock.rs    — vector clocks: increment, merge, compare
//! instance.rs — the ServiceInstance record and its tombstones
//! resolver.rs — deterministic winner selection policies
//! store.rs    — the replicated map, apply rule, anti-entropy loop
//! ```

pub mod clock;
pub mod instance;
pub mod resolver;
pub mod store;

use std::collections::BTreeMap;

pub use clock::{ClockOrdering, VectorClock};
pub use instance::ServiceInstance;
pub use resolver::{ConflictPolicy, ConflictResolver};
pub use store::{DistributedRegistry, RegistryStatistics};

/// The narrow registry capability other components consume.
///
/// The tracker and the peer runtime need to announce and look up
/// services; they have no business with apply rules, snapshots, or the
/// gossip plumbing. Depending on this trait instead of the concrete
/// registry keeps the component graph acyclic.
pub trait ServiceDirectory: Send + Sync {
    fn register(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> bool;

    fn deregister(&self, service_type: &str, service_id: &str) -> bool;

    fn discover(&self, service_type: &str) -> Vec<ServiceInstance>;

    fn lookup(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance>;
}

impl ServiceDirectory for DistributedRegistry {
    fn register(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> bool {
        self.register_service(service_type, service_id, host, port, metadata)
    }

    fn deregister(&self, service_type: &str, service_id: &str) -> bool {
        self.deregister_service(service_type, service_id)
    }

    fn discover(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.discover_services(service_type)
    }

    fn lookup(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        self.get_service(service_type, service_id)
    }
}
