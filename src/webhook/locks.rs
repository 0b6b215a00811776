//! Per-(user, service) async locks.
//!
//! Renewal, registration and disconnect for the same credential record can
//! arrive concurrently from different requests; they take the record's lock
//! before touching its webhook columns.

use crate::credentials::ServiceId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<(String, ServiceId), Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `(user_id, service)`.
    pub async fn acquire(&self, user_id: &str, service: ServiceId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((user_id.to_string(), service))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
