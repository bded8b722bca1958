//! Request IDs for correlating proxy logs.
//!
//! IDs are a per-process random prefix plus a counter, so they stay
//! short while remaining distinct across restarts.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Header carrying the request ID to and from upstreams.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static PROCESS_TAG: LazyLock<u32> = LazyLock::new(|| fastrand::u32(..));
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Request ID that can be included in tracing spans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new process-unique request ID.
    pub fn new() -> Self {
        let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:08x}-{:06x}", *PROCESS_TAG, count))
    }

    /// Use an existing ID, e.g. one supplied by the client.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
