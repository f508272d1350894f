use std::sync::Mutex;

use tokio::sync::oneshot;

/// Cond is a condition variable with a monotonic version counter.
///
/// Subscribers register with the last version they observed and are woken
/// once the version moves past it. Delivery is edge-triggered and
/// coalescing: any number of `notify` calls between reads produce a single
/// wakeup carrying the latest version, and a subscriber that consumed one
/// notification must register again to see the next.
#[derive(Debug, Default)]
pub struct Cond {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    waiters: Vec<oneshot::Sender<u64>>,
}

impl Cond {
    pub fn new() -> Cond {
        Cond::default()
    }

    /// Current version of the condition.
    pub fn version(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .version
    }

    /// Parks a subscriber until the version exceeds `last_seen`, then
    /// delivers the current version. If the version has already moved past
    /// `last_seen` the receiver resolves immediately.
    pub fn register(&self, last_seen: u64) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.version > last_seen {
            // receiver may already be gone, that is its problem
            let _ = tx.send(inner.version);
        } else {
            inner.waiters.push(tx);
        }
        rx
    }

    /// Increments the version and wakes all parked subscribers. Never
    /// blocks the notifier.
    pub fn notify(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.version += 1;
        let version = inner.version;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(version);
        }
    }
}
