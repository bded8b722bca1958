//! Lookup filters over discovered services.

use crate::service::{Service, Status};

/// Datacenter wildcard matching every datacenter.
pub const ANY_DATACENTER: &str = "*";

/// Criteria for selecting services from the registry.
///
/// Empty fields match anything. All fields must match, except `tags`,
/// which matches when any one of the listed tags is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub id: String,
    pub status: Option<Status>,
    pub tags: Vec<String>,
    pub service: String,
    pub datacenter: String,
}

impl Filter {
    /// Filter selecting every instance of the named service.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: name.into(),
            ..Self::default()
        }
    }

    /// Whether the filter spans all datacenters.
    pub fn is_any_datacenter(&self) -> bool {
        self.datacenter == ANY_DATACENTER
    }

    /// Check `service` against every criterion.
    pub fn matches(&self, service: &Service) -> bool {
        if !self.id.is_empty() && self.id != service.id {
            return false;
        }

        match self.status {
            Some(status) if status != Status::Undefined && status != service.status => {
                return false;
            }
            _ => {}
        }

        if !self.datacenter.is_empty()
            && !self.is_any_datacenter()
            && self.datacenter != service.datacenter
        {
            return false;
        }

        if !self.service.is_empty() && self.service != service.name {
            return false;
        }

        self.tags.is_empty() || self.tags.iter().any(|tag| service.tags.contains(tag))
    }
}
