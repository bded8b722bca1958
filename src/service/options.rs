//! Registration options for announcing a service to the registry.

use crate::discovery::DiscoveryError;
use crate::service::{Service, weight_by_tags};
use serde::{Deserialize, Serialize};

/// Ceiling of the load score produced by [`weight_by_tags`].
const MAX_LOAD_SCORE: i64 = 1000;

/// Everything needed to register one service instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Options {
    pub id: String,
    pub name: String,
    /// `host:port`, optionally prefixed with a URL scheme.
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub check: CheckInfo,
}

/// Health check the registry should run against the instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CheckInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
}

impl Options {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    /// Append a `key=value` tag.
    pub fn add_tag(&mut self, key: &str, value: &str) {
        self.tags.push(format!("{key}={value}"));
    }

    /// Build the service record these options describe.
    ///
    /// The status starts undefined until the registry reports a health
    /// check result. The weight is the inverse of the tag load score, so
    /// idle instances attract more traffic than busy ones.
    pub fn service(&self) -> Result<Service, DiscoveryError> {
        let (host, port) = split_address(&self.address)?;
        let load = weight_by_tags(&self.tags);

        Ok(Service::new(&self.id, &self.name, host, port)
            .with_tags(self.tags.iter().cloned())
            .with_weight(MAX_LOAD_SCORE.saturating_sub(load).max(1)))
    }
}

/// Split `[scheme://]host:port[/path]` into host and port.
fn split_address(address: &str) -> Result<(&str, u16), DiscoveryError> {
    let invalid = || DiscoveryError::InvalidAddress(address.to_string());

    let authority = match address.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or(rest),
        None => address,
    };

    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port.is_empty() {
        return Err(invalid());
    }

    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}
