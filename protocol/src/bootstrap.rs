//! # Component Bootstrap
//!
//! Startup as data: each subsystem implements [`Component`] (an id, its
//! dependencies, start/stop hooks, a readiness probe) and the
//! [`Bootstrap`] starter brings the set up in topological order and down
//! in reverse. A failure partway through stops the already-started prefix
//! before returning, so a process never runs with half its components.
//!
//! Dependency cycles are rejected up front as `InvalidArgument`; a
//! dependency on an unregistered id is rejected the same way.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Result, ShoalError};

/// A startable/stoppable subsystem with declared dependencies.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique id within one bootstrap.
    fn id(&self) -> &str;

    /// Ids of components that must be running before this one starts.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Whether the component currently considers itself up.
    fn ready(&self) -> bool;
}

/// Topological starter over a set of components.
#[derive(Default)]
pub struct Bootstrap {
    components: Vec<Arc<dyn Component>>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component. Duplicate ids are rejected.
    pub fn register(&mut self, component: Arc<dyn Component>) -> Result<()> {
        if self.components.iter().any(|c| c.id() == component.id()) {
            return Err(ShoalError::AlreadyExists(format!(
                "component '{}' registered twice",
                component.id()
            )));
        }
        self.components.push(component);
        Ok(())
    }

    /// Dependency-respecting start order (Kahn's algorithm). Stable for
    /// independent components: registration order breaks ties.
    pub fn start_order(&self) -> Result<Vec<String>> {
        let ids: HashSet<&str> = self.components.iter().map(|c| c.id()).collect();
        let mut remaining_deps: HashMap<&str, HashSet<String>> = HashMap::new();

        for component in &self.components {
            let deps = component.dependencies();
            for dep in &deps {
                if !ids.contains(dep.as_str()) {
                    return Err(ShoalError::InvalidArgument(format!(
                        "component '{}' depends on unknown '{dep}'",
                        component.id()
                    )));
                }
            }
            remaining_deps.insert(component.id(), deps.into_iter().collect());
        }

        let mut order = Vec::with_capacity(self.components.len());
        let mut started: HashSet<String> = HashSet::new();

        while order.len() < self.components.len() {
            let next = self.components.iter().find(|c| {
                !started.contains(c.id())
                    && remaining_deps[c.id()].iter().all(|d| started.contains(d))
            });
            let Some(next) = next else {
                let stuck: Vec<&str> = self
                    .components
                    .iter()
                    .map(|c| c.id())
                    .filter(|id| !started.contains(*id))
                    .collect();
                return Err(ShoalError::InvalidArgument(format!(
                    "dependency cycle among components: {stuck:?}"
                )));
            };
            started.insert(next.id().to_string());
            order.push(next.id().to_string());
        }
        Ok(order)
    }

    /// Starts everything in dependency order. On failure, stops the
    /// started prefix in reverse and returns the original error.
    pub async fn start_all(&self) -> Result<Vec<String>> {
        let order = self.start_order()?;
        let mut started: Vec<&Arc<dyn Component>> = Vec::new();

        for id in &order {
            let component = self
                .components
                .iter()
                .find(|c| c.id() == id)
                .ok_or_else(|| ShoalError::Internal(format!("component '{id}' vanished")))?;

            info!(component = %id, "starting component");
            if let Err(e) = component.start().await {
                error!(component = %id, error = %e, "component failed to start, rolling back");
                for done in started.into_iter().rev() {
                    if let Err(stop_err) = done.stop().await {
                        warn!(component = %done.id(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e);
            }
            started.push(component);
        }

        Ok(order)
    }

    /// Stops everything in reverse start order. Stop failures are logged
    /// and do not prevent the remaining components from stopping.
    pub async fn stop_all(&self) {
        let order = match self.start_order() {
            Ok(order) => order,
            // A cycle cannot happen here if start_all ran, but stopping in
            // registration order is still better than not stopping.
            Err(_) => self.components.iter().map(|c| c.id().to_string()).collect(),
        };

        for id in order.iter().rev() {
            if let Some(component) = self.components.iter().find(|c| c.id() == id) {
                info!(component = %id, "stopping component");
                if let Err(e) = component.stop().await {
                    warn!(component = %id, error = %e, "component stop failed");
                }
            }
        }
    }

    /// True when every registered component reports ready.
    pub fn all_ready(&self) -> bool {
        self.components.iter().all(|c| c.ready())
    }

    /// Parks until the process receives SIGINT or SIGTERM, then stops
    /// every component in reverse start order. The signal rides the same
    /// watch-channel shutdown idiom the components use internally, so a
    /// binary's main loop is just `start_all` → `run_until_signal`.
    pub async fn run_until_signal(&self) {
        let mut signal = signal_channel();
        while !*signal.borrow() {
            if signal.changed().await.is_err() {
                break;
            }
        }
        info!("shutdown signal received, stopping components");
        self.stop_all().await;
    }
}

/// A watch channel that flips to `true` on SIGINT or SIGTERM (SIGTERM on
/// Unix only). Each signal source runs as its own forwarding task; the
/// receiver is what callers select or wait on.
pub fn signal_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    let interrupt = tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = interrupt.send(true);
            }
            Err(e) => warn!(error = %e, "Ctrl+C handler unavailable"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                if sigterm.recv().await.is_some() {
                    let _ = tx.send(true);
                }
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    });
    #[cfg(not(unix))]
    drop(tx);

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe {
        id: String,
        deps: Vec<String>,
        up: AtomicBool,
        fail_start: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn build(
            id: &str,
            deps: &[&str],
            fail_start: bool,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                up: AtomicBool::new(false),
                fail_start,
                log: Arc::clone(log),
            })
        }

        fn new(id: &str, deps: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Self::build(id, deps, false, log)
        }

        fn failing(id: &str, deps: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Self::build(id, deps, true, log)
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn id(&self) -> &str {
            &self.id
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(ShoalError::Internal(format!("{} refuses to start", self.id)));
            }
            self.up.store(true, Ordering::SeqCst);
            self.log.lock().push(format!("start:{}", self.id));
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.up.store(false, Ordering::SeqCst);
            self.log.lock().push(format!("stop:{}", self.id));
            Ok(())
        }

        fn ready(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn starts_in_dependency_order_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut boot = Bootstrap::new();
        // Registered out of order on purpose.
        boot.register(Probe::new("peer", &["registry", "tracker"], &log)).unwrap();
        boot.register(Probe::new("tracker", &["registry"], &log)).unwrap();
        boot.register(Probe::new("registry", &[], &log)).unwrap();

        let order = boot.start_all().await.unwrap();
        assert_eq!(order, vec!["registry", "tracker", "peer"]);
        assert!(boot.all_ready());

        boot.stop_all().await;
        assert!(!boot.all_ready());

        let events = log.lock().clone();
        assert_eq!(
            events,
            vec![
                "start:registry",
                "start:tracker",
                "start:peer",
                "stop:peer",
                "stop:tracker",
                "stop:registry",
            ]
        );
    }

    #[tokio::test]
    async fn failure_rolls_back_started_prefix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut boot = Bootstrap::new();
        boot.register(Probe::new("registry", &[], &log)).unwrap();
        boot.register(Probe::failing("tracker", &["registry"], &log)).unwrap();
        boot.register(Probe::new("peer", &["tracker"], &log)).unwrap();

        let err = boot.start_all().await.unwrap_err();
        assert!(matches!(err, ShoalError::Internal(_)));

        let events = log.lock().clone();
        assert_eq!(events, vec!["start:registry", "stop:registry"]);
        assert!(!boot.all_ready());
    }

    #[test]
    fn cycles_and_unknown_deps_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut boot = Bootstrap::new();
        boot.register(Probe::new("a", &["b"], &log)).unwrap();
        boot.register(Probe::new("b", &["a"], &log)).unwrap();
        assert!(matches!(
            boot.start_order(),
            Err(ShoalError::InvalidArgument(_))
        ));

        let mut boot = Bootstrap::new();
        boot.register(Probe::new("a", &["ghost"], &log)).unwrap();
        assert!(matches!(
            boot.start_order(),
            Err(ShoalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut boot = Bootstrap::new();
        boot.register(Probe::new("a", &[], &log)).unwrap();
        assert!(matches!(
            boot.register(Probe::new("a", &[], &log)),
            Err(ShoalError::AlreadyExists(_))
        ));
    }
}
