//! Short-lived in-flight leases keyed by request hash.
//!
//! The first miss on a hash becomes the leader and generates; concurrent
//! misses on the same hash follow and receive the leader's published value.
//! A leader that drops its guard without publishing releases the followers,
//! who then generate on their own. Nothing here is held across the store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

type Slots<T> = Arc<DashMap<String, watch::Receiver<Option<T>>>>;

pub struct InflightLeases<T: Clone> {
    slots: Slots<T>,
}

pub enum Lease<T: Clone> {
    Leader(LeaseGuard<T>),
    Follower(watch::Receiver<Option<T>>),
}

impl<T: Clone + Send + Sync + 'static> InflightLeases<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, hash: &str) -> Lease<T> {
        match self.slots.entry(hash.to_string()) {
            Entry::Occupied(slot) => Lease::Follower(slot.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Lease::Leader(LeaseGuard {
                    hash: hash.to_string(),
                    tx,
                    slots: self.slots.clone(),
                })
            }
        }
    }

    /// Wait for the leader's value. `None` if the leader gave up or the wait
    /// timed out.
    pub async fn follow(mut rx: watch::Receiver<Option<T>>, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return Some(value);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InflightLeases<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the leader for the duration of its generation.
pub struct LeaseGuard<T: Clone> {
    hash: String,
    tx: watch::Sender<Option<T>>,
    slots: Slots<T>,
}

impl<T: Clone> LeaseGuard<T> {
    /// Hand the value to every follower and release the lease.
    pub fn publish(self, value: T) {
        let _ = self.tx.send(Some(value));
    }
}

impl<T: Clone> Drop for LeaseGuard<T> {
    fn drop(&mut self) {
        self.slots.remove(&self.hash);
    }
}
