//! Keyed wait registry for route registration.
//!
//! A waiter registers its oneshot before checking the route table, and the
//! router binds before notifying, so a bind that lands between the check and
//! the await is never missed. A waiter that times out or is dropped removes
//! its own entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct WaitersInner {
    next_id: u64,
    waiters: HashMap<String, HashMap<u64, oneshot::Sender<()>>>,
}

/// Waiters keyed by route id.
#[derive(Debug, Default)]
pub struct RouteWaiters {
    inner: Mutex<WaitersInner>,
}

struct WaitTicket<'a> {
    owner: &'a RouteWaiters,
    route: String,
    id: u64,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.owner.remove(&self.route, self.id);
    }
}

impl RouteWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaitersInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, route: &str) -> (WaitTicket<'_>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .waiters
            .entry(route.to_string())
            .or_default()
            .insert(id, tx);
        let ticket = WaitTicket {
            owner: self,
            route: route.to_string(),
            id,
        };
        (ticket, rx)
    }

    fn remove(&self, route: &str, id: u64) {
        let mut inner = self.lock();
        if let Some(entries) = inner.waiters.get_mut(route) {
            entries.remove(&id);
            if entries.is_empty() {
                inner.waiters.remove(route);
            }
        }
    }

    /// Wake every waiter on `route`. Call after the route is bound.
    pub fn notify(&self, route: &str) {
        let entries = self.lock().waiters.remove(route);
        for (_, tx) in entries.into_iter().flatten() {
            let _ = tx.send(());
        }
    }

    /// Number of outstanding waiters on `route`.
    pub fn waiter_count(&self, route: &str) -> usize {
        self.lock().waiters.get(route).map_or(0, HashMap::len)
    }

    /// Wait until `route` is bound or `timeout` passes.
    ///
    /// `is_bound` is checked once after registering; later binds arrive
    /// through [`RouteWaiters::notify`].
    pub async fn wait_until<F>(&self, route: &str, timeout: Duration, is_bound: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let (_ticket, rx) = self.register(route);
        if is_bound() {
            return true;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}
