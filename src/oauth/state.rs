//! OAuth `state` correlation tokens.
//!
//! The callback endpoint is a public redirect with no session of its own, so
//! the `state` value is the only link back to the user who started the flow.
//! States are opaque UUIDs issued by the initiation endpoint, bound to a
//! (user, service) pair, single-use, and valid for a bounded window. A
//! client-supplied value that was never issued here is rejected.

use crate::credentials::ServiceId;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Who started an authorization flow, and when.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAuthorization {
    pub service: ServiceId,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
}

/// Issued-state registry with expiry.
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<DashMap<String, PendingAuthorization>>,
    ttl: Duration,
}

impl StateManager {
    /// `ttl_seconds`: how long an issued state may be redeemed (600 in production).
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issue a fresh state for `user_id` connecting `service`.
    pub fn issue(&self, service: ServiceId, user_id: &str) -> String {
        let state = Uuid::new_v4().to_string();
        self.pending.insert(
            state.clone(),
            PendingAuthorization {
                service,
                user_id: user_id.to_string(),
                issued_at: Utc::now(),
            },
        );
        state
    }

    /// Redeem a state. Returns `None` if it was never issued, was already
    /// redeemed, or has expired. The entry is removed in every case.
    pub fn redeem(&self, state: &str) -> Option<PendingAuthorization> {
        let (_, pending) = self.pending.remove(state)?;

        if Utc::now() - pending.issued_at > self.ttl {
            return None;
        }

        Some(pending)
    }

    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.pending.retain(|_, p| now - p.issued_at <= self.ttl);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Background task that sweeps expired states.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.sweep_expired();
        tracing::debug!(
            pending = manager.pending_count(),
            "OAuth state sweep complete"
        );
    }
}
