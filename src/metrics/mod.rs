//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{BorrowSource, MetricsCollector, RefreshResult, ReturnOutcome, UNKNOWN_SERVICE};
pub use server::MetricsServer;
