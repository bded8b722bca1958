//! Weighted connection pools, one per logical service.

mod connection;
mod item;
mod pool;

pub use connection::Connection;
pub use item::{ServiceItem, UpstreamItem};
pub use pool::{DEFAULT_IDLE_CAPACITY, Upstream};
