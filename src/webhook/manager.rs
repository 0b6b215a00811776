use super::locks::KeyedLocks;
use super::provider::{PushChannelProvider, WatchRequest};
use crate::credentials::{CredentialStore, ServiceId, WebhookChannel, WebhookState};
use crate::error::SyncError;
use crate::oauth::{ensure_fresh_access_token, TokenEndpoint};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Channels expiring sooner than this are replaced.
pub const DEFAULT_RENEWAL_THRESHOLD_HOURS: i64 = 24;

/// Longest lifetime accepted from the provider.
pub const MAX_CHANNEL_TTL_DAYS: i64 = 7;

#[derive(Clone, Debug)]
pub struct WebhookSettings {
    /// Public URL the provider delivers notifications to
    pub callback_url: String,
    pub renewal_threshold: Duration,
    pub max_ttl: Duration,
}

impl WebhookSettings {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            renewal_threshold: Duration::hours(DEFAULT_RENEWAL_THRESHOLD_HOURS),
            max_ttl: Duration::days(MAX_CHANNEL_TTL_DAYS),
        }
    }
}

/// Result of a renewal check for one user.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewalOutcome {
    StillValid { hours_remaining: i64 },
    Renewed(WebhookChannel),
}

/// Per-user result of a bulk renewal pass.
#[derive(Debug)]
pub struct UserRenewal {
    pub user_id: String,
    pub result: Result<RenewalOutcome, SyncError>,
}

/// Owns the push-channel lifecycle for one service.
///
/// Every method takes the record's lock from the shared [`KeyedLocks`] before
/// reading or writing webhook fields, and re-reads the record under it.
pub struct WebhookManager {
    store: Arc<CredentialStore>,
    tokens: Arc<dyn TokenEndpoint>,
    channels: Arc<dyn PushChannelProvider>,
    locks: KeyedLocks,
    settings: WebhookSettings,
}

impl WebhookManager {
    pub fn new(
        store: Arc<CredentialStore>,
        tokens: Arc<dyn TokenEndpoint>,
        channels: Arc<dyn PushChannelProvider>,
        locks: KeyedLocks,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            store,
            tokens,
            channels,
            locks,
            settings,
        }
    }

    pub fn service(&self) -> ServiceId {
        self.tokens.service()
    }

    /// Open a new channel for `user_id`, replacing any existing one.
    pub async fn register(&self, user_id: &str) -> Result<WebhookChannel, SyncError> {
        let _guard = self.locks.acquire(user_id, self.service()).await;
        self.register_locked(user_id).await
    }

    /// Renew the channel if it expires within the renewal threshold, or if
    /// there is no usable channel at all.
    pub async fn check_and_renew(&self, user_id: &str) -> Result<RenewalOutcome, SyncError> {
        let service = self.service();
        let _guard = self.locks.acquire(user_id, service).await;

        let record = self
            .store
            .get_active(user_id, service)?
            .ok_or_else(|| SyncError::NotConnected {
                user_id: user_id.to_string(),
                service,
            })?;

        match record.webhook_state() {
            WebhookState::Active(channel) => {
                let remaining = channel.expires_at - Utc::now();
                if remaining >= self.settings.renewal_threshold {
                    debug!(
                        user_id = %user_id,
                        hours_remaining = remaining.num_hours(),
                        "Webhook still valid"
                    );
                    return Ok(RenewalOutcome::StillValid {
                        hours_remaining: remaining.num_hours(),
                    });
                }
                info!(
                    user_id = %user_id,
                    channel_id = %channel.channel_id,
                    hours_remaining = remaining.num_hours(),
                    "Webhook expiring soon, renewing"
                );
            }
            WebhookState::Unregistered => {
                info!(user_id = %user_id, "No webhook registered, registering");
            }
            WebhookState::Inconsistent => {
                warn!(user_id = %user_id, "Webhook fields incomplete, re-registering");
            }
        }

        self.register_locked(user_id).await.map(RenewalOutcome::Renewed)
    }

    /// Stop the channel (best-effort) and soft-delete the credential record.
    /// Calling this for an already disconnected or unknown user succeeds.
    pub async fn disconnect(&self, user_id: &str) -> Result<(), SyncError> {
        let service = self.service();
        let _guard = self.locks.acquire(user_id, service).await;

        let Some(record) = self.store.get(user_id, service)? else {
            debug!(user_id = %user_id, "Disconnect for unknown user, nothing to do");
            return Ok(());
        };

        if let (true, WebhookState::Active(channel)) = (record.is_active, record.webhook_state()) {
            let access_token =
                match ensure_fresh_access_token(&self.store, self.tokens.as_ref(), user_id).await {
                    Ok(credentials) => credentials.access_token,
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "Using stored token for channel stop");
                        record.credentials.access_token.clone()
                    }
                };
            self.stop_quietly(&access_token, user_id, &channel).await;
        }

        self.store.deactivate(user_id, service)?;
        info!(user_id = %user_id, service = %service, "Integration disconnected");
        Ok(())
    }

    /// Run [`check_and_renew`](Self::check_and_renew) for every active user.
    /// One user's failure does not affect the others.
    pub async fn renew_all(&self) -> Result<Vec<UserRenewal>, SyncError> {
        let users = self.store.list_active(self.service())?;
        info!(service = %self.service(), users = users.len(), "Starting webhook renewal pass");

        let mut results = Vec::with_capacity(users.len());
        for user_id in users {
            let result = self.check_and_renew(&user_id).await;
            if let Err(ref e) = result {
                warn!(user_id = %user_id, error = %e, "Webhook renewal failed");
            }
            results.push(UserRenewal { user_id, result });
        }

        self.locks.prune();
        Ok(results)
    }

    async fn register_locked(&self, user_id: &str) -> Result<WebhookChannel, SyncError> {
        let service = self.service();
        let credentials = ensure_fresh_access_token(&self.store, self.tokens.as_ref(), user_id).await?;

        let record = self
            .store
            .get_active(user_id, service)?
            .ok_or_else(|| SyncError::NotConnected {
                user_id: user_id.to_string(),
                service,
            })?;
        // Replaced only after the new channel is stored, so a failed watch
        // keeps the existing channel delivering
        let previous = match record.webhook_state() {
            WebhookState::Active(previous) => Some(previous),
            _ => None,
        };

        let request = WatchRequest {
            channel_id: Uuid::new_v4().to_string(),
            callback_url: self.settings.callback_url.clone(),
            channel_token: user_id.to_string(),
            ttl_seconds: self.settings.max_ttl.num_seconds(),
        };

        let grant = self
            .channels
            .watch(&credentials.access_token, &request)
            .await
            .map_err(|e| {
                warn!(user_id = %user_id, error = %e, "Webhook registration failed");
                match e {
                    SyncError::WebhookRegistration(_) => e,
                    other => SyncError::WebhookRegistration(other.to_string()),
                }
            })?;

        let cap = Utc::now() + self.settings.max_ttl;
        let channel = WebhookChannel {
            channel_id: request.channel_id,
            resource_id: grant.resource_id,
            expires_at: grant.expires_at.map_or(cap, |granted| granted.min(cap)),
        };

        let stored = match self.store.set_webhook(user_id, service, &channel) {
            Ok(stored) => stored,
            Err(e) => {
                self.stop_quietly(&credentials.access_token, user_id, &channel).await;
                return Err(e.into());
            }
        };
        if !stored {
            self.stop_quietly(&credentials.access_token, user_id, &channel).await;
            return Err(SyncError::NotConnected {
                user_id: user_id.to_string(),
                service,
            });
        }

        if let Some(previous) = previous {
            self.stop_quietly(&credentials.access_token, user_id, &previous).await;
        }

        info!(
            user_id = %user_id,
            channel_id = %channel.channel_id,
            expires_at = %channel.expires_at,
            "Webhook registered"
        );
        Ok(channel)
    }

    async fn stop_quietly(&self, access_token: &str, user_id: &str, channel: &WebhookChannel) {
        if let Err(e) = self
            .channels
            .stop(access_token, &channel.channel_id, &channel.resource_id)
            .await
        {
            warn!(
                user_id = %user_id,
                channel_id = %channel.channel_id,
                error = %e,
                "Failed to stop webhook channel, continuing"
            );
        }
    }
}
