//! reglb - a registry-driven client-side load balancer
//!
//! This crate provides:
//! - Service records and filters describing registered instances
//! - Pluggable discovery backends (in-memory and YAML catalog file)
//! - Weighted round-robin upstream pools with idle connection reuse
//! - A balancer reconciling pools with the registry on a schedule
//! - An HTTP proxy and Prometheus metrics endpoint in front of it

pub mod balancer;
pub mod config;
pub mod discovery;
pub mod metrics;
pub mod proxy;
pub mod service;
pub mod upstream;
pub mod util;

pub use balancer::Balancer;
pub use config::Config;
pub use discovery::{Discovery, DiscoveryError};
pub use service::{Filter, Options, Service, Status};
pub use upstream::{Connection, Upstream};
