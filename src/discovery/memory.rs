//! In-process registry.
//!
//! Holds the catalog in memory, keyed by service ID. Producers such as a
//! container observer register and unregister instances; health results
//! are fed in through [`MemoryDiscovery::set_status`].

use crate::discovery::{Discovery, DiscoveryError};
use crate::service::{Filter, Options, Service, Status, datacenter_from_tags, sort_by_id};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Registry held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    /// Registered instances by ID.
    services: DashMap<String, Service>,
    /// Datacenter stamped on registrations and used to scope unfiltered lookups.
    datacenter: Option<String>,
}

impl MemoryDiscovery {
    /// Create an empty registry spanning all datacenters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry local to `datacenter`.
    pub fn with_datacenter(datacenter: impl Into<String>) -> Self {
        Self {
            services: DashMap::new(),
            datacenter: Some(datacenter.into()),
        }
    }

    /// Record the result of a health check for the instance `id`.
    pub fn set_status(&self, id: &str, status: Status) -> Result<(), DiscoveryError> {
        let mut entry = self
            .services
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::NotFound(id.to_string()))?;
        entry.status = status;
        debug!(id = %id, status = %status, "service status updated");
        Ok(())
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(&self, mut options: Options) -> Result<(), DiscoveryError> {
        if let Some(dc) = &self.datacenter {
            if datacenter_from_tags(&options.tags).is_none() {
                options.add_tag("DC", dc);
            }
        }

        let service = options.service()?;
        debug!(id = %service.id, name = %service.name, host = %service.host(), "service registered");
        self.services.insert(service.id.clone(), service);
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), DiscoveryError> {
        match self.services.remove(id) {
            Some(_) => {
                debug!(id = %id, "service unregistered");
                Ok(())
            }
            None => Err(DiscoveryError::NotFound(id.to_string())),
        }
    }

    async fn lookup(&self, filter: Option<&Filter>) -> Result<Vec<Service>, DiscoveryError> {
        let local;
        let filter = match (filter, &self.datacenter) {
            (None, Some(dc)) => {
                local = Filter {
                    datacenter: dc.clone(),
                    ..Filter::default()
                };
                Some(&local)
            }
            (filter, _) => filter,
        };

        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|entry| entry.value().test(filter))
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_id(&mut services);
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ANY_DATACENTER;
    use tokio_test::block_on;

    fn options(id: &str, name: &str, port: u16) -> Options {
        Options::new(id, name, format!("10.0.0.1:{port}"))
    }

    #[test]
    fn test_register_and_lookup() {
        let discovery = MemoryDiscovery::new();
        block_on(discovery.register(options("web-1", "web", 81))).unwrap();
        block_on(discovery.register(options("api-2", "api", 82))).unwrap();
        block_on(discovery.register(options("api-1", "api", 80))).unwrap();

        let all = block_on(discovery.lookup(None)).unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["api-1", "api-2", "web-1"]);

        let api = block_on(discovery.lookup(Some(&Filter::service("api")))).unwrap();
        assert_eq!(api.len(), 2);
    }

    #[test]
    fn test_register_replaces_same_id() {
        let discovery = MemoryDiscovery::new();
        block_on(discovery.register(options("api-1", "api", 80))).unwrap();
        block_on(discovery.register(options("api-1", "api", 90))).unwrap();

        let all = block_on(discovery.lookup(None)).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, 90);
    }

    #[test]
    fn test_unregister() {
        let discovery = MemoryDiscovery::new();
        block_on(discovery.register(options("api-1", "api", 80))).unwrap();

        block_on(discovery.unregister("api-1")).unwrap();
        assert!(discovery.is_empty());
        assert!(matches!(
            block_on(discovery.unregister("api-1")),
            Err(DiscoveryError::NotFound(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_address() {
        let discovery = MemoryDiscovery::new();
        let result = block_on(discovery.register(Options::new("x", "api", "nowhere")));
        assert!(matches!(result, Err(DiscoveryError::InvalidAddress(_))));
        assert!(discovery.is_empty());
    }

    #[test]
    fn test_set_status() {
        let discovery = MemoryDiscovery::new();
        block_on(discovery.register(options("api-1", "api", 80))).unwrap();
        discovery.set_status("api-1", Status::Passing).unwrap();

        let passing = Filter {
            status: Some(Status::Passing),
            ..Filter::default()
        };
        let found = block_on(discovery.lookup(Some(&passing))).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].weight() > 0);

        assert!(discovery.set_status("missing", Status::Passing).is_err());
    }

    #[test]
    fn test_local_datacenter_scoping() {
        let discovery = MemoryDiscovery::with_datacenter("dc1");
        block_on(discovery.register(options("api-1", "api", 80))).unwrap();

        let mut remote = options("api-2", "api", 81);
        remote.add_tag("DC", "dc2");
        block_on(discovery.register(remote)).unwrap();

        let local = block_on(discovery.lookup(None)).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].datacenter, "dc1");

        let everywhere = Filter {
            datacenter: ANY_DATACENTER.to_string(),
            ..Filter::default()
        };
        let all = block_on(discovery.lookup(Some(&everywhere))).unwrap();
        assert_eq!(all.len(), 2);
    }
}
