//! Registry backed by a YAML catalog file.
//!
//! The file is re-read on every lookup, so edits show up on the next
//! refresh without restarting. The catalog is maintained out of band;
//! registration through this backend is refused.

use crate::discovery::{Discovery, DiscoveryError};
use crate::service::{Filter, Options, Service, Status, sort_by_id};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One instance listed in the catalog file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub options: Options,
    /// Last known health status.
    #[serde(default)]
    pub status: Status,
}

impl CatalogEntry {
    /// Service record for this entry, carrying its health status.
    pub fn service(&self) -> Result<Service, DiscoveryError> {
        Ok(self.options.service()?.with_status(self.status))
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    services: Vec<CatalogEntry>,
}

/// Read-only registry over a catalog file.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse catalog text into service records.
    pub fn parse(contents: &str) -> Result<Vec<Service>, DiscoveryError> {
        let catalog: Catalog = serde_yaml::from_str(contents)?;
        catalog.services.iter().map(CatalogEntry::service).collect()
    }
}

#[async_trait]
impl Discovery for FileDiscovery {
    async fn register(&self, _options: Options) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::ReadOnly)
    }

    async fn unregister(&self, _id: &str) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::ReadOnly)
    }

    async fn lookup(&self, filter: Option<&Filter>) -> Result<Vec<Service>, DiscoveryError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mut services = Self::parse(&contents)?;
        services.retain(|srv| srv.test(filter));
        sort_by_id(&mut services);

        debug!(path = %self.path.display(), found = services.len(), "catalog lookup");
        Ok(services)
    }
}
