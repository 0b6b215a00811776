//! Validation and proactive refresh of the application's own auth session.
//!
//! Long-lived clients (the renewal worker, for one) hold a session issued by
//! the identity provider. [`SessionManager::validate`] reports how close it is
//! to expiry and [`SessionManager::refresh`] renews it, collapsing concurrent
//! refreshes into one outbound call. [`run_session_monitor`] drives both on an
//! interval and reports when the session can no longer be kept alive.

mod http;

pub use http::HttpIdentityProvider;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::credentials::mask_token;


/// Sessions expiring sooner than this report `needs_refresh`.
pub const REFRESH_THRESHOLD_SECS: i64 = 300;

/// A session issued by the identity provider.
#[derive(Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &mask_token(&self.access_token))
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionStatus {
    pub is_valid: bool,
    pub needs_refresh: bool,
    /// `None` when there is no session at all
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("session rejected: {0}")]
    Rejected(String),

    #[error("no session to refresh")]
    NoSession,
}

impl SessionError {
    /// Network-class failures are retried; everything else is terminal.
    pub fn is_network(&self) -> bool {
        match self {
            SessionError::Network(_) => true,
            other => is_network_message(&other.to_string()),
        }
    }
}

/// Whether an error message looks like a connectivity problem.
pub fn is_network_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["network", "fetch", "timeout", "connection"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The session currently held, if any.
    async fn current_session(&self) -> Option<Session>;

    /// Exchange the held refresh token for a new session.
    async fn refresh_session(&self) -> Result<Session, SessionError>;
}

/// Bookkeeping guarded by the refresh lock.
#[derive(Debug, Default)]
pub struct RefreshRecord {
    /// Outcome of the last completed refresh run
    pub last_succeeded: bool,
}

/// One per session; share it between every manager handling that session.
pub type RefreshLock = Arc<Mutex<RefreshRecord>>;

pub fn new_refresh_lock() -> RefreshLock {
    Arc::new(Mutex::new(RefreshRecord::default()))
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub refresh_threshold: Duration,
    pub max_attempts: u32,
    pub retry_backoff: std::time::Duration,
    /// How long a caller waits for someone else's in-flight refresh
    pub wait_timeout: std::time::Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::seconds(REFRESH_THRESHOLD_SECS),
            max_attempts: 3,
            retry_backoff: std::time::Duration::from_secs(2),
            wait_timeout: std::time::Duration::from_secs(10),
        }
    }
}

pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    refresh_lock: RefreshLock,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, refresh_lock: RefreshLock, settings: SessionSettings) -> Self {
        Self {
            provider,
            refresh_lock,
            settings,
        }
    }

    pub async fn validate(&self) -> SessionStatus {
        let Some(session) = self.provider.current_session().await else {
            return SessionStatus {
                is_valid: false,
                needs_refresh: false,
                expires_at: None,
            };
        };

        let remaining = session.expires_at - Utc::now();
        SessionStatus {
            is_valid: remaining > Duration::zero(),
            needs_refresh: remaining < self.settings.refresh_threshold,
            expires_at: Some(session.expires_at),
        }
    }

    /// Current access token, if a session is held.
    pub async fn access_token(&self) -> Option<String> {
        self.provider.current_session().await.map(|s| s.access_token)
    }

    /// Refresh the session. Returns whether a usable session resulted.
    ///
    /// If another refresh is already running, waits up to the configured
    /// bound for it and returns its outcome instead of calling the provider
    /// again.
    pub async fn refresh(&self) -> bool {
        let mut record = match self.refresh_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Session refresh already in progress, waiting");
                return match tokio::time::timeout(
                    self.settings.wait_timeout,
                    self.refresh_lock.lock(),
                )
                .await
                {
                    Ok(record) => record.last_succeeded,
                    Err(_) => {
                        warn!(
                            wait_ms = self.settings.wait_timeout.as_millis() as u64,
                            "Timed out waiting for in-flight session refresh"
                        );
                        false
                    }
                };
            }
        };

        let succeeded = self.refresh_with_retry().await;
        record.last_succeeded = succeeded;
        debug!(succeeded, "Session refresh finished");
        succeeded
    }

    async fn refresh_with_retry(&self) -> bool {
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.provider.refresh_session().await {
                Ok(session) => {
                    info!(
                        attempt,
                        expires_at = %session.expires_at,
                        access_token = %mask_token(&session.access_token),
                        "Session refreshed"
                    );
                    return true;
                }
                Err(e) if e.is_network() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Session refresh hit a network error, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Session refresh failed");
                    return false;
                }
            }
        }

        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryReason {
    NoSession,
    RefreshFailed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Refreshed { expires_at: Option<DateTime<Utc>> },
    /// Terminal; the monitor stops after sending this
    Expired { reason: ExpiryReason },
}

/// Validate on every tick and refresh when needed. Sends
/// [`SessionEvent::Expired`] and returns once the session is gone or cannot
/// be refreshed.
pub async fn run_session_monitor(
    manager: Arc<SessionManager>,
    interval: std::time::Duration,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let status = manager.validate().await;
        if status.expires_at.is_none() {
            info!("No session held, stopping session monitor");
            let _ = events
                .send(SessionEvent::Expired {
                    reason: ExpiryReason::NoSession,
                })
                .await;
            return;
        }

        if !status.needs_refresh {
            continue;
        }

        if manager.refresh().await {
            let expires_at = manager.validate().await.expires_at;
            if events.send(SessionEvent::Refreshed { expires_at }).await.is_err() {
                debug!("Session event receiver dropped, stopping monitor");
                return;
            }
        } else {
            warn!("Session could not be refreshed, re-authentication required");
            let _ = events
                .send(SessionEvent::Expired {
                    reason: ExpiryReason::RefreshFailed,
                })
                .await;
            return;
        }
    }
}
