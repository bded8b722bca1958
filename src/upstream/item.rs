//! Pool members.

use crate::service::Service;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

/// A member of an upstream pool.
///
/// Members are matched across refreshes by [`host`](UpstreamItem::host),
/// not by registry ID.
pub trait UpstreamItem: Send + Sync + std::fmt::Debug {
    /// Current routing weight; zero takes the member out of rotation.
    fn weight(&self) -> u64;

    /// Overwrite the routing weight.
    fn set_weight(&self, weight: i64);

    /// Routable `address:port`.
    fn host(&self) -> &str;
}

/// Pool member backed by a discovered [`Service`].
#[derive(Debug)]
pub struct ServiceItem {
    service: RwLock<Service>,
    host: OnceLock<String>,
}

impl ServiceItem {
    pub fn new(service: Service) -> Self {
        Self {
            service: RwLock::new(service),
            host: OnceLock::new(),
        }
    }

    /// Wrap `service` ready for [`Upstream::update`](crate::upstream::Upstream::update).
    pub fn shared(service: Service) -> Arc<dyn UpstreamItem> {
        Arc::new(Self::new(service))
    }

    /// Snapshot of the wrapped service.
    pub fn service(&self) -> Service {
        self.service.read().clone()
    }
}

impl UpstreamItem for ServiceItem {
    fn weight(&self) -> u64 {
        self.service.read().weight()
    }

    fn set_weight(&self, weight: i64) {
        self.service.write().set_weight(weight);
    }

    fn host(&self) -> &str {
        self.host.get_or_init(|| self.service.read().host())
    }
}
