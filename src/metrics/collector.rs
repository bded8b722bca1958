//! Metrics collector using prometheus-client.
//!
//! Tracks borrows, returns, refreshes, pool sizes, and proxied requests.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Service label used for names that have no upstream, so arbitrary
/// request hosts cannot grow the label set.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Labels carrying only the service name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Labels for borrow metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BorrowLabels {
    pub service: String,
    pub source: BorrowSource,
}

/// Where a borrowed connection came from.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BorrowSource {
    /// Reused from the idle queue.
    Idle,
    /// Freshly selected by weight.
    Select,
    /// Nothing available.
    Miss,
}

/// Labels for return metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReturnLabels {
    pub service: String,
    pub outcome: ReturnOutcome,
}

/// What happened to a returned connection.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ReturnOutcome {
    Recycled,
    Dropped,
}

/// Labels for refresh metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub result: RefreshResult,
}

/// Outcome of a registry refresh.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshResult {
    Success,
    Empty,
    Failure,
}

/// Labels for proxied request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub service: String,
    pub status: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    borrows_total: Family<BorrowLabels, Counter>,
    returns_total: Family<ReturnLabels, Counter>,
    refreshes_total: Family<RefreshLabels, Counter>,
    /// Pool members per service, including those out of rotation.
    upstream_items: Family<ServiceLabels, Gauge>,
    /// Sum of member weights per service.
    upstream_weight: Family<ServiceLabels, Gauge>,
    requests_total: Family<RequestLabels, Counter>,
    /// Proxied request duration histogram (in seconds).
    request_duration_seconds: Family<ServiceLabels, Histogram>,
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let borrows_total = Family::<BorrowLabels, Counter>::default();
        let returns_total = Family::<ReturnLabels, Counter>::default();
        let refreshes_total = Family::<RefreshLabels, Counter>::default();
        let upstream_items = Family::<ServiceLabels, Gauge>::default();
        let upstream_weight = Family::<ServiceLabels, Gauge>::default();
        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );

        registry.register(
            "reglb_borrows",
            "Connections handed out, by source",
            borrows_total.clone(),
        );
        registry.register(
            "reglb_returns",
            "Connections handed back, by outcome",
            returns_total.clone(),
        );
        registry.register(
            "reglb_refreshes",
            "Registry refreshes, by result",
            refreshes_total.clone(),
        );
        registry.register(
            "reglb_upstream_items",
            "Members in each upstream pool",
            upstream_items.clone(),
        );
        registry.register(
            "reglb_upstream_weight",
            "Total routing weight of each upstream pool",
            upstream_weight.clone(),
        );
        registry.register(
            "reglb_proxy_requests",
            "Requests forwarded by the proxy",
            requests_total.clone(),
        );
        registry.register(
            "reglb_proxy_request_duration_seconds",
            "Proxied request duration in seconds",
            request_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                borrows_total,
                returns_total,
                refreshes_total,
                upstream_items,
                upstream_weight,
                requests_total,
                request_duration_seconds,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a borrow attempt.
    pub fn record_borrow(&self, service: &str, source: BorrowSource) {
        let labels = BorrowLabels {
            service: service.to_string(),
            source,
        };
        self.inner.borrows_total.get_or_create(&labels).inc();
    }

    /// Record a returned connection.
    pub fn record_return(&self, service: &str, recycled: bool) {
        let labels = ReturnLabels {
            service: service.to_string(),
            outcome: if recycled {
                ReturnOutcome::Recycled
            } else {
                ReturnOutcome::Dropped
            },
        };
        self.inner.returns_total.get_or_create(&labels).inc();
    }

    /// Record the result of a refresh.
    pub fn record_refresh(&self, result: RefreshResult) {
        self.inner
            .refreshes_total
            .get_or_create(&RefreshLabels { result })
            .inc();
    }

    /// Publish the size and weight of an upstream pool.
    pub fn set_upstream(&self, service: &str, items: usize, total_weight: u64) {
        let labels = ServiceLabels {
            service: service.to_string(),
        };
        self.inner
            .upstream_items
            .get_or_create(&labels)
            .set(items as i64);
        self.inner
            .upstream_weight
            .get_or_create(&labels)
            .set(total_weight as i64);
    }

    /// Record a completed proxied request.
    pub fn record_request(&self, service: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            service: service.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();

        let service_labels = ServiceLabels {
            service: service.to_string(),
        };
        self.inner
            .request_duration_seconds
            .get_or_create(&service_labels)
            .observe(duration.as_secs_f64());
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
