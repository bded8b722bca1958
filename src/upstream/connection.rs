//! Borrowed connection handles.

use crate::upstream::UpstreamItem;
use crate::upstream::pool::{Inner, Upstream};
use std::error::Error;
use std::sync::{Arc, Weak};

/// A routable endpoint borrowed from an [`Upstream`].
///
/// Releasing consumes the handle, so it goes back to its pool at most once.
pub struct Connection {
    pub(super) item: Arc<dyn UpstreamItem>,
    pub(super) service: Arc<str>,
    pub(super) upstream: Weak<Inner>,
}

impl Connection {
    /// `address:port` to send the request to.
    pub fn host(&self) -> &str {
        self.item.host()
    }

    /// Logical service this connection belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current weight of the underlying pool member.
    pub fn weight(&self) -> u64 {
        self.item.weight()
    }

    /// Hand the connection back to its pool.
    ///
    /// `error` describes a failed use; such connections, and connections
    /// whose member has left rotation, are dropped instead of kept idle.
    /// Returns whether the connection was kept for reuse.
    pub fn release(self, error: Option<&dyn Error>) -> bool {
        if self.item.weight() == 0 {
            return false;
        }
        match self.upstream.upgrade() {
            Some(inner) => Upstream::from_inner(inner).return_connection(self, error),
            None => false,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.service)
            .field("host", &self.host())
            .finish()
    }
}
