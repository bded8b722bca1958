//! Service registry capability and the bundled registry backends.

mod file;
mod memory;

pub use file::{CatalogEntry, FileDiscovery};
pub use memory::MemoryDiscovery;

use crate::service::{Filter, Options, Service};
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a registry backend.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid service address: {0}")]
    InvalidAddress(String),

    #[error("service not registered: {0}")]
    NotFound(String),

    #[error("registry is read-only")]
    ReadOnly,

    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A registry of service instances.
///
/// Implementations must be safe to call repeatedly, and must report a
/// failure as an error rather than as an empty result.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register a new instance, replacing any instance with the same ID.
    async fn register(&self, options: Options) -> Result<(), DiscoveryError>;

    /// Remove the instance registered under `id`.
    async fn unregister(&self, id: &str) -> Result<(), DiscoveryError>;

    /// Instances matching `filter`, or every instance when there is none.
    async fn lookup(&self, filter: Option<&Filter>) -> Result<Vec<Service>, DiscoveryError>;
}
