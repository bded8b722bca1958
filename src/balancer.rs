//! Registry-driven balancer.
//!
//! Keeps one [`Upstream`] per logical service name and reconciles them
//! against the registry on every refresh. Upstreams are created the first
//! time a service name is seen and are never removed; instances that drop
//! out of the registry are zero-weighted until they come back.

use crate::discovery::{Discovery, DiscoveryError};
use crate::metrics::{BorrowSource, MetricsCollector, RefreshResult, UNKNOWN_SERVICE};
use crate::service::Service;
use crate::upstream::{Connection, ServiceItem, Upstream, UpstreamItem};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest refresh period the supervisor will run at.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Client-side balancer over every service in a registry.
///
/// Cloning is cheap and yields a handle to the same balancer.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

struct BalancerInner {
    discovery: Arc<dyn Discovery>,
    /// Idle queue capacity for every upstream created.
    max_idle: usize,
    upstreams: RwLock<HashMap<String, Upstream>>,
    /// Stop signal of the running supervisor, if any.
    supervisor: Mutex<Option<oneshot::Sender<()>>>,
    metrics: MetricsCollector,
}

impl Balancer {
    /// Create a balancer over `discovery`. Upstreams keep at most
    /// `max_idle` idle connections each (zero selects the default).
    pub fn new(discovery: Arc<dyn Discovery>, max_idle: usize) -> Self {
        Self::with_metrics(discovery, max_idle, MetricsCollector::new())
    }

    /// Create a balancer reporting into `metrics`.
    pub fn with_metrics(
        discovery: Arc<dyn Discovery>,
        max_idle: usize,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            inner: Arc::new(BalancerInner {
                discovery,
                max_idle,
                upstreams: RwLock::new(HashMap::new()),
                supervisor: Mutex::new(None),
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Borrow a connection to `service`.
    ///
    /// `None` means no instance is available: the name has not been
    /// discovered yet or its pool is empty. Misses for undiscovered names
    /// are counted under [`UNKNOWN_SERVICE`].
    pub fn borrow(&self, service: &str) -> Option<Connection> {
        let Some(upstream) = self.upstream(service) else {
            debug!(service = %service, "borrow for unknown service");
            self.inner.metrics.record_borrow(UNKNOWN_SERVICE, BorrowSource::Miss);
            return None;
        };

        if let Some(conn) = upstream.borrow_idle() {
            self.inner.metrics.record_borrow(service, BorrowSource::Idle);
            return Some(conn);
        }

        let conn = upstream.next();
        let source = if conn.is_some() {
            BorrowSource::Select
        } else {
            BorrowSource::Miss
        };
        self.inner.metrics.record_borrow(service, source);
        conn
    }

    /// Return a borrowed connection, with the error its use ended in.
    ///
    /// Returns whether the connection was kept for reuse.
    pub fn return_connection(&self, conn: Connection, error: Option<&dyn Error>) -> bool {
        let service = conn.service().to_string();
        let recycled = conn.release(error);
        self.inner.metrics.record_return(&service, recycled);
        recycled
    }

    /// Reconcile every upstream with the registry.
    ///
    /// A failed or empty lookup leaves the pools untouched, so a registry
    /// outage keeps routing to the last known instances.
    pub async fn refresh(&self) -> Result<(), DiscoveryError> {
        let services = match self.inner.discovery.lookup(None).await {
            Ok(services) => services,
            Err(e) => {
                self.inner.metrics.record_refresh(RefreshResult::Failure);
                return Err(e);
            }
        };

        if services.is_empty() {
            debug!("registry returned no services, keeping current pools");
            self.inner.metrics.record_refresh(RefreshResult::Empty);
            return Ok(());
        }

        let instances = services.len();
        let grouped = group_by_name(services);

        // Services absent from the registry are zeroed, the rest swap their
        // members in one step so selection never sees an empty pool.
        for upstream in self.upstreams() {
            if !grouped.contains_key(upstream.name()) {
                upstream.reset();
            }
        }

        for (name, items) in grouped {
            self.upstream_or_insert(&name).reset_and_update(items);
        }

        for upstream in self.upstreams() {
            self.inner
                .metrics
                .set_upstream(upstream.name(), upstream.len(), upstream.total_weight());
        }

        self.inner.metrics.record_refresh(RefreshResult::Success);
        debug!(instances, "registry refresh complete");
        Ok(())
    }

    /// Spawn a task that refreshes now and then on every tick of
    /// `interval` until [`stop`] is called or another supervisor takes over.
    ///
    /// The stop signal is installed before this returns, so a [`stop`]
    /// issued right after spawning is never lost. Refresh errors are logged
    /// and retried on the next tick. Must be called within a tokio runtime.
    ///
    /// [`stop`]: Balancer::stop
    pub fn supervisor(&self, interval: Duration) -> JoinHandle<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        if let Some(previous) = self.inner.supervisor.lock().replace(stop_tx) {
            let _ = previous.send(());
        }

        let balancer = self.clone();
        tokio::spawn(async move { balancer.supervise(interval, stop_rx).await })
    }

    async fn supervise(&self, interval: Duration, mut stop_rx: oneshot::Receiver<()>) {
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        info!(interval = ?interval, "balancer supervisor starting");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = &mut stop_rx => break,

                _ = ticker.tick() => {
                    // A lookup still in flight when stop arrives is abandoned
                    // before it can touch the pools.
                    tokio::select! {
                        biased;

                        _ = &mut stop_rx => break,

                        result = self.refresh() => {
                            if let Err(e) = result {
                                warn!(error = %e, "registry refresh failed");
                            }
                        }
                    }
                }
            }
        }

        info!("balancer supervisor stopped");
    }

    /// Stop the running supervisor. No-op when none is running.
    pub fn stop(&self) {
        if let Some(stop) = self.inner.supervisor.lock().take() {
            let _ = stop.send(());
        }
    }

    /// Names of every known service, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.upstreams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Upstream pool for `service`, if it has been discovered.
    pub fn upstream(&self, service: &str) -> Option<Upstream> {
        self.inner.upstreams.read().get(service).cloned()
    }

    fn upstreams(&self) -> Vec<Upstream> {
        self.inner.upstreams.read().values().cloned().collect()
    }

    fn upstream_or_insert(&self, service: &str) -> Upstream {
        if let Some(upstream) = self.upstream(service) {
            return upstream;
        }

        self.inner
            .upstreams
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                info!(service = %service, "new upstream discovered");
                Upstream::new(service, self.inner.max_idle)
            })
            .clone()
    }
}

/// Group discovered instances into pool items by service name, keeping
/// registry order within each group.
fn group_by_name(services: Vec<Service>) -> BTreeMap<String, Vec<Arc<dyn UpstreamItem>>> {
    let mut grouped: BTreeMap<String, Vec<Arc<dyn UpstreamItem>>> = BTreeMap::new();
    for service in services {
        grouped
            .entry(service.name.clone())
            .or_default()
            .push(ServiceItem::shared(service));
    }
    grouped
}
