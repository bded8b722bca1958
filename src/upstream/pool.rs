//! Weighted round-robin pool with an idle-connection queue.
//!
//! Selection walks a cursor over the cumulative weight space. Each call
//! advances the cursor by `step_size` (the largest member weight) modulo the
//! total weight, then picks the member whose weight bucket contains it.
//! Stepping by the largest weight spreads consecutive picks across members
//! instead of draining one bucket before moving to the next. When the total
//! is an exact multiple of the step, the step is bumped by one so the cursor
//! still reaches every bucket.

use crate::upstream::{Connection, UpstreamItem};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, trace};

/// Idle queue capacity used when none is configured.
pub const DEFAULT_IDLE_CAPACITY: usize = 1000;

/// Weighted pool of connections for one logical service.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    name: Arc<str>,
    /// Members, selection totals, and the cursor.
    state: Mutex<PoolState>,
    /// Released connections awaiting reuse.
    idle: IdleQueue,
}

#[derive(Default)]
struct PoolState {
    /// Members in first-seen order.
    items: Vec<Arc<dyn UpstreamItem>>,
    total_weight: u64,
    step_size: u64,
    current_step: u64,
}

impl PoolState {
    fn position(&self, host: &str) -> Option<usize> {
        self.items.iter().position(|it| it.host() == host)
    }

    fn refresh_step_counters(&mut self) {
        self.total_weight = 0;
        self.step_size = 0;
        for item in &self.items {
            let weight = item.weight();
            self.total_weight = self.total_weight.saturating_add(weight);
            self.step_size = self.step_size.max(weight);
        }

        if self.step_size > 0 && self.total_weight % self.step_size == 0 {
            self.step_size = self.step_size.saturating_add(1);
        }
    }

    fn zero_weights(&mut self) {
        self.step_size = 0;
        self.total_weight = 0;
        for item in &self.items {
            item.set_weight(0);
        }
    }

    fn merge<I>(&mut self, service: &str, items: I)
    where
        I: IntoIterator<Item = Arc<dyn UpstreamItem>>,
    {
        for item in items {
            match self.position(item.host()) {
                Some(idx) => self.items[idx] = item,
                None => {
                    debug!(service = %service, host = %item.host(), "upstream member added");
                    self.items.push(item);
                }
            }
        }
        self.refresh_step_counters();

        trace!(
            service = %service,
            items = self.items.len(),
            total_weight = self.total_weight,
            step_size = self.step_size,
            "upstream updated"
        );
    }

    fn select(&mut self) -> Option<Arc<dyn UpstreamItem>> {
        if self.items.is_empty() {
            return None;
        }

        if self.step_size > 0 && self.total_weight > 0 {
            let next = (u128::from(self.current_step) + u128::from(self.step_size))
                % u128::from(self.total_weight);
            // Below total_weight, so it fits back into u64.
            self.current_step = next as u64;
            let mut row = self.current_step;
            for item in &self.items {
                let weight = item.weight();
                if weight > row {
                    return Some(Arc::clone(item));
                }
                row -= weight;
            }
        }

        // Degenerate weights: every member is out of rotation.
        let idx = fastrand::usize(..self.items.len());
        Some(Arc::clone(&self.items[idx]))
    }
}

/// Bounded queue that never blocks: pushes on a full queue and pops on an
/// empty one both fail immediately.
struct IdleQueue {
    queue: Mutex<VecDeque<Connection>>,
    capacity: usize,
}

impl IdleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn try_push(&self, conn: Connection) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(conn);
        true
    }

    fn try_pop(&self) -> Option<Connection> {
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Upstream {
    /// Create an empty pool keeping at most `max_idle` released connections.
    /// Zero selects [`DEFAULT_IDLE_CAPACITY`].
    pub fn new(name: impl Into<String>, max_idle: usize) -> Self {
        let capacity = if max_idle == 0 {
            DEFAULT_IDLE_CAPACITY
        } else {
            max_idle
        };
        let name: String = name.into();

        Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                state: Mutex::new(PoolState::default()),
                idle: IdleQueue::new(capacity),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Logical service name of this pool.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Zero every member's weight ahead of a fresh update.
    ///
    /// Members absent from the following update stay in the pool with
    /// weight zero and can be revived by a later update.
    pub fn reset(&self) {
        self.inner.state.lock().zero_weights();
    }

    /// Merge `items` into the pool.
    ///
    /// An item whose host is already present replaces the old member in
    /// place; new hosts are appended. Totals are then recomputed over the
    /// whole pool.
    pub fn update<I>(&self, items: I)
    where
        I: IntoIterator<Item = Arc<dyn UpstreamItem>>,
    {
        self.inner.state.lock().merge(&self.inner.name, items);
    }

    /// [`reset`](Upstream::reset) then [`update`](Upstream::update) under a
    /// single lock, so concurrent selections never see an all-zero pool.
    pub fn reset_and_update<I>(&self, items: I)
    where
        I: IntoIterator<Item = Arc<dyn UpstreamItem>>,
    {
        let mut state = self.inner.state.lock();
        state.zero_weights();
        state.merge(&self.inner.name, items);
    }

    /// Take a connection, preferring idle ones over a fresh selection.
    pub fn borrow(&self) -> Option<Connection> {
        self.borrow_idle().or_else(|| self.next())
    }

    /// Pop the first idle connection whose member is still in rotation.
    pub(crate) fn borrow_idle(&self) -> Option<Connection> {
        while let Some(conn) = self.inner.idle.try_pop() {
            if conn.weight() > 0 {
                return Some(conn);
            }
            trace!(service = %self.inner.name, host = %conn.host(), "discarding stale idle connection");
        }
        None
    }

    /// Select a connection by weighted round-robin, ignoring idle ones.
    pub fn next(&self) -> Option<Connection> {
        let item = self.inner.state.lock().select()?;
        Some(Connection {
            item,
            service: Arc::clone(&self.inner.name),
            upstream: Arc::downgrade(&self.inner),
        })
    }

    /// Queue `conn` for reuse unless its use failed or the queue is full.
    ///
    /// Returns whether the connection was queued.
    pub(crate) fn return_connection(&self, conn: Connection, error: Option<&dyn Error>) -> bool {
        if !std::ptr::eq(conn.upstream.as_ptr(), Arc::as_ptr(&self.inner)) {
            debug!(service = %self.inner.name, host = %conn.host(), "ignoring connection from another pool");
            return false;
        }
        if let Some(err) = error {
            debug!(service = %self.inner.name, host = %conn.host(), error = %err, "dropping failed connection");
            return false;
        }
        self.inner.idle.try_push(conn)
    }

    /// Number of members, including ones out of rotation.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_weight(&self) -> u64 {
        self.inner.state.lock().total_weight
    }

    pub fn step_size(&self) -> u64 {
        self.inner.state.lock().step_size
    }

    /// Connections waiting in the idle queue.
    pub fn idle_len(&self) -> usize {
        self.inner.idle.len()
    }

    /// Member hosts in pool order.
    pub fn hosts(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.items.iter().map(|it| it.host().to_string()).collect()
    }

    /// Member weights in pool order.
    pub fn weights(&self) -> Vec<u64> {
        let state = self.inner.state.lock();
        state.items.iter().map(|it| it.weight()).collect()
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.inner.name)
            .field("items", &self.len())
            .field("total_weight", &self.total_weight())
            .field("idle", &self.idle_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MAX_WEIGHT, Service, Status};
    use crate::upstream::ServiceItem;
    use std::collections::HashMap;
    use std::io;

    fn item(port: u16, weight: i64) -> Arc<dyn UpstreamItem> {
        ServiceItem::shared(
            Service::new(format!("svc-{port}"), "api", "10.0.0.1", port)
                .with_status(Status::Passing)
                .with_weight(weight),
        )
    }

    fn count_hosts(up: &Upstream, rounds: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            let conn = up.next().unwrap();
            *counts.entry(conn.host().to_string()).or_default() += 1;
        }
        counts
    }

    #[test]
    fn test_empty_upstream() {
        let up = Upstream::new("api", 10);
        assert!(up.next().is_none());
        assert!(up.borrow().is_none());
        assert!(up.is_empty());
    }

    #[test]
    fn test_step_counters() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 3), item(2, 1)]);
        assert_eq!(up.total_weight(), 4);
        assert_eq!(up.step_size(), 3);

        // Total divisible by the largest weight bumps the step.
        let up = Upstream::new("api", 10);
        up.update([item(1, 2), item(2, 2)]);
        assert_eq!(up.total_weight(), 4);
        assert_eq!(up.step_size(), 3);
    }

    #[test]
    fn test_weighted_distribution() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 3), item(2, 1)]);

        let counts = count_hosts(&up, 40);
        assert_eq!(counts["10.0.0.1:1"], 30);
        assert_eq!(counts["10.0.0.1:2"], 10);
    }

    #[test]
    fn test_distribution_covers_every_member() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 1000), item(2, 1000), item(3, 1000)]);

        let counts = count_hosts(&up, 3000);
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 1000);
        }
    }

    #[test]
    fn test_update_is_idempotent() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 5), item(2, 7), item(3, 2)]);
        let (total, step) = (up.total_weight(), up.step_size());

        up.update([item(1, 5), item(2, 7), item(3, 2)]);
        assert_eq!(up.total_weight(), total);
        assert_eq!(up.step_size(), step);
        assert_eq!(up.len(), 3);
    }

    #[test]
    fn test_update_replaces_in_place() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 5), item(2, 5), item(3, 5)]);
        up.update([item(2, 9)]);

        assert_eq!(up.hosts(), ["10.0.0.1:1", "10.0.0.1:2", "10.0.0.1:3"]);
        assert_eq!(up.weights(), [5, 9, 5]);
        assert_eq!(up.total_weight(), 19);
    }

    #[test]
    fn test_soft_removal_and_revival() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 4), item(2, 4), item(3, 4)]);

        up.reset();
        assert_eq!(up.total_weight(), 0);
        up.update([item(1, 4), item(3, 4)]);

        assert_eq!(up.len(), 3);
        assert_eq!(up.weights(), [4, 0, 4]);
        let counts = count_hosts(&up, 100);
        assert!(!counts.contains_key("10.0.0.1:2"));

        up.reset();
        up.update([item(1, 4), item(2, 4), item(3, 4)]);
        assert_eq!(up.hosts(), ["10.0.0.1:1", "10.0.0.1:2", "10.0.0.1:3"]);
        assert!(count_hosts(&up, 100).contains_key("10.0.0.1:2"));
    }

    #[test]
    fn test_reset_and_update_soft_removes() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 4), item(2, 4), item(3, 4)]);

        up.reset_and_update([item(1, 4), item(3, 4)]);
        assert_eq!(up.weights(), [4, 0, 4]);
        assert_eq!(up.total_weight(), 8);
        assert!(!count_hosts(&up, 100).contains_key("10.0.0.1:2"));
    }

    #[derive(Debug)]
    struct FixedItem {
        host: String,
        weight: u64,
    }

    impl UpstreamItem for FixedItem {
        fn weight(&self) -> u64 {
            self.weight
        }

        fn set_weight(&self, _weight: i64) {}

        fn host(&self) -> &str {
            &self.host
        }
    }

    #[test]
    fn test_huge_weights_do_not_overflow() {
        let up = Upstream::new("api", 10);
        up.update([item(1, i64::MAX), item(2, i64::MAX), item(3, i64::MAX)]);
        assert_eq!(up.total_weight(), 3 * MAX_WEIGHT);
        assert_eq!(count_hosts(&up, 30).values().sum::<usize>(), 30);

        let fixed = Upstream::new("fixed", 10);
        fixed.update((1..=3).map(|port| {
            Arc::new(FixedItem {
                host: format!("10.0.0.2:{port}"),
                weight: u64::MAX,
            }) as Arc<dyn UpstreamItem>
        }));
        assert_eq!(fixed.total_weight(), u64::MAX);
        for _ in 0..10 {
            assert!(fixed.next().is_some());
        }
    }

    #[test]
    fn test_connection_from_another_pool_rejected() {
        let api = Upstream::new("api", 10);
        api.update([item(1, 1)]);
        let web = Upstream::new("web", 10);
        web.update([item(2, 1)]);

        let conn = api.next().unwrap();
        assert!(!web.return_connection(conn, None));
        assert_eq!(web.idle_len(), 0);
        assert_eq!(api.idle_len(), 0);
    }

    #[test]
    fn test_degenerate_weights_pick_any_member() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 4), item(2, 4)]);
        up.reset();

        let counts = count_hosts(&up, 400);
        // Uniform fallback reaches the last member too.
        assert!(counts.contains_key("10.0.0.1:1"));
        assert!(counts.contains_key("10.0.0.1:2"));
    }

    #[test]
    fn test_borrow_prefers_idle() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 1), item(2, 1), item(3, 1)]);

        let conn = up.borrow().unwrap();
        let host = conn.host().to_string();
        assert!(conn.release(None));
        assert_eq!(up.idle_len(), 1);

        for _ in 0..5 {
            let again = up.borrow().unwrap();
            assert_eq!(again.host(), host);
            assert!(again.release(None));
        }
    }

    #[test]
    fn test_failed_connection_not_reused() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 1)]);

        let conn = up.borrow().unwrap();
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!conn.release(Some(&err)));
        assert_eq!(up.idle_len(), 0);

        // Still a pool member, so fresh selection finds it.
        assert!(up.borrow().is_some());
    }

    #[test]
    fn test_idle_queue_bounded() {
        let up = Upstream::new("api", 2);
        up.update([item(1, 1)]);

        let conns: Vec<_> = (0..3).map(|_| up.next().unwrap()).collect();
        let kept: Vec<bool> = conns.into_iter().map(|c| c.release(None)).collect();
        assert_eq!(kept, [true, true, false]);
        assert_eq!(up.idle_len(), 2);
    }

    #[test]
    fn test_default_idle_capacity() {
        let up = Upstream::new("api", 0);
        up.update([item(1, 1)]);
        for _ in 0..DEFAULT_IDLE_CAPACITY + 5 {
            let conn = up.next().unwrap();
            up.return_connection(conn, None);
        }
        assert_eq!(up.idle_len(), DEFAULT_IDLE_CAPACITY);
    }

    #[test]
    fn test_stale_idle_connections_discarded() {
        let up = Upstream::new("api", 10);
        up.update([item(1, 1), item(2, 1)]);

        let conn = up.next().unwrap();
        let host = conn.host().to_string();
        assert!(conn.release(None));

        // The member leaves rotation; its idle handle must not come back.
        up.reset();
        let survivor = if host == "10.0.0.1:1" { item(2, 1) } else { item(1, 1) };
        up.update([survivor]);

        let conn = up.borrow().unwrap();
        assert_ne!(conn.host(), host);
        assert_eq!(up.idle_len(), 0);
    }

    #[test]
    fn test_concurrent_borrow_and_return() {
        let up = Upstream::new("api", 100);
        up.update([item(1, 3), item(2, 2), item(3, 1)]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let up = up.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let conn = up.borrow().expect("pool is populated");
                        up.return_connection(conn, None);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            up.reset();
            up.update([item(1, 3), item(2, 2), item(3, 1)]);
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(up.len(), 3);
        assert_eq!(up.total_weight(), 6);
        assert!(up.idle_len() <= 100);
    }
}
