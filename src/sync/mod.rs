//! Push-notification intake and reconciliation dispatch.
//!
//! Google delivers change notifications as bodiless POSTs whose meaning is
//! carried in `X-Goog-*` headers. The orchestrator attributes each one to a
//! user through the channel token, checks it belongs to that user's current
//! channel, and queues a reconciliation job. The HTTP handler always answers
//! 200 regardless of the outcome here.

pub mod mapping;
pub mod reconcile;

pub use mapping::{CalendarEvent, EventChange, GoogleEvent};
pub use reconcile::{CalendarReconciler, EventSink, GoogleEventsClient, HttpEventSink, TracingEventSink};

use crate::credentials::{CredentialStore, ServiceId, WebhookState};
use crate::error::SyncError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const HEADER_CHANNEL_ID: &str = "x-goog-channel-id";
pub const HEADER_RESOURCE_STATE: &str = "x-goog-resource-state";
pub const HEADER_RESOURCE_ID: &str = "x-goog-resource-id";
pub const HEADER_CHANNEL_TOKEN: &str = "x-goog-channel-token";
pub const HEADER_MESSAGE_NUMBER: &str = "x-goog-message-number";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Handshake sent once when a channel is created
    Sync,
    Exists,
    NotExists,
}

impl FromStr for ResourceState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(ResourceState::Sync),
            "exists" => Ok(ResourceState::Exists),
            "not_exists" => Ok(ResourceState::NotExists),
            other => Err(SyncError::Attribution(format!("unknown resource state '{}'", other))),
        }
    }
}

/// One push notification, as read from its headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub channel_id: String,
    pub resource_state: ResourceState,
    pub resource_id: Option<String>,
    pub channel_token: Option<String>,
    pub message_number: Option<u64>,
}

impl Notification {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, SyncError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let channel_id = header(HEADER_CHANNEL_ID)
            .ok_or_else(|| SyncError::Attribution("missing channel id header".to_string()))?;
        let resource_state = header(HEADER_RESOURCE_STATE)
            .ok_or_else(|| SyncError::Attribution("missing resource state header".to_string()))?
            .parse()?;

        Ok(Self {
            channel_id,
            resource_state,
            resource_id: header(HEADER_RESOURCE_ID),
            channel_token: header(HEADER_CHANNEL_TOKEN),
            message_number: header(HEADER_MESSAGE_NUMBER).and_then(|n| n.parse().ok()),
        })
    }
}

/// Work item for the reconcile worker.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileJob {
    pub user_id: String,
    pub channel_id: String,
    pub resource_state: ResourceState,
    pub message_number: Option<u64>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub upserted: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// Brings the CRM's copy of a user's calendar up to date.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, job: &ReconcileJob) -> Result<ReconcileSummary, SyncError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum NotificationOutcome {
    Handshake,
    Queued { user_id: String },
    /// Attributed, but the queue was full; parked in the backlog
    Backlogged { user_id: String },
}

/// Users whose notification arrived while the queue was full, keyed by user
/// with the latest job kept. The worker drains it after every queued job.
pub type Backlog = Arc<DashMap<String, ReconcileJob>>;

pub fn new_backlog() -> Backlog {
    Arc::new(DashMap::new())
}

pub struct SyncOrchestrator {
    store: Arc<CredentialStore>,
    service: ServiceId,
    queue: mpsc::Sender<ReconcileJob>,
    backlog: Backlog,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<CredentialStore>, queue: mpsc::Sender<ReconcileJob>) -> Self {
        Self::with_backlog(store, queue, new_backlog())
    }

    pub fn with_backlog(store: Arc<CredentialStore>, queue: mpsc::Sender<ReconcileJob>, backlog: Backlog) -> Self {
        Self {
            store,
            service: ServiceId::GoogleCalendar,
            queue,
            backlog,
        }
    }

    /// Shared with [`run_reconcile_worker`].
    pub fn backlog(&self) -> Backlog {
        self.backlog.clone()
    }

    /// Attribute a notification and queue reconciliation for it.
    ///
    /// Returns [`SyncError::Attribution`] when the channel token names no
    /// active user, or names one whose current channel is a different one.
    pub fn handle(&self, notification: &Notification) -> Result<NotificationOutcome, SyncError> {
        if notification.resource_state == ResourceState::Sync {
            debug!(channel_id = %notification.channel_id, "Webhook handshake received");
            return Ok(NotificationOutcome::Handshake);
        }

        let user_id = notification
            .channel_token
            .as_deref()
            .ok_or_else(|| SyncError::Attribution("notification carries no channel token".to_string()))?;

        let record = self
            .store
            .get_active(user_id, self.service)?
            .ok_or_else(|| SyncError::Attribution(format!("no active integration for user {}", user_id)))?;

        match record.webhook_state() {
            WebhookState::Active(channel) if channel.channel_id == notification.channel_id => {}
            _ => {
                return Err(SyncError::Attribution(format!(
                    "channel {} is not the current channel for user {}",
                    notification.channel_id, user_id
                )));
            }
        }

        let job = ReconcileJob {
            user_id: user_id.to_string(),
            channel_id: notification.channel_id.clone(),
            resource_state: notification.resource_state,
            message_number: notification.message_number,
            received_at: Utc::now(),
        };

        match self.queue.try_send(job) {
            Ok(()) => {
                debug!(
                    user_id = %user_id,
                    message_number = ?notification.message_number,
                    "Reconciliation queued"
                );
                Ok(NotificationOutcome::Queued {
                    user_id: user_id.to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                // A full queue always has a job ahead, so the worker reaches the backlog
                warn!(user_id = %user_id, "Reconcile queue full, parking notification in backlog");
                self.backlog.insert(job.user_id.clone(), job);
                Ok(NotificationOutcome::Backlogged {
                    user_id: user_id.to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::Configuration(
                "reconcile worker is not running".to_string(),
            )),
        }
    }
}

/// Drain the queue, one job at a time, until every sender is dropped.
/// Backlogged users are reconciled after each queued job.
pub async fn run_reconcile_worker(
    mut jobs: mpsc::Receiver<ReconcileJob>,
    reconciler: Arc<dyn Reconciler>,
    backlog: Backlog,
) {
    info!("Reconcile worker started");

    while let Some(job) = jobs.recv().await {
        reconcile_one(reconciler.as_ref(), &job).await;

        let parked: Vec<String> = backlog.iter().map(|entry| entry.key().clone()).collect();
        for user_id in parked {
            if let Some((_, job)) = backlog.remove(&user_id) {
                debug!(user_id = %user_id, "Reconciling backlogged user");
                reconcile_one(reconciler.as_ref(), &job).await;
            }
        }
    }

    info!("Reconcile worker stopped");
}

async fn reconcile_one(reconciler: &dyn Reconciler, job: &ReconcileJob) {
    match reconciler.reconcile(job).await {
        Ok(summary) => info!(
            user_id = %job.user_id,
            upserted = summary.upserted,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "Calendar reconciled"
        ),
        Err(e) if e.requires_reconnect() => {
            warn!(user_id = %job.user_id, error = %e, "Reconciliation needs the user to reconnect")
        }
        Err(e) => warn!(user_id = %job.user_id, error = %e, "Reconciliation failed"),
    }
}
