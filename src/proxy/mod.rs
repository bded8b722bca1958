//! HTTP front door for the balancer.

mod http_proxy;

pub use http_proxy::{HttpProxy, ProxyError, service_from_authority};
