//! Pull-side reconciliation: after a change notification, list recently
//! updated events and apply them to the CRM.

use super::mapping::{from_google_event, CalendarEvent, EventChange, GoogleEvent};
use super::{ReconcileJob, ReconcileSummary, Reconciler};
use crate::credentials::CredentialStore;
use crate::error::SyncError;
use crate::oauth::{ensure_fresh_access_token, TokenEndpoint};
use crate::webhook::GOOGLE_CALENDAR_API;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where reconciled events land.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn upsert_event(&self, user_id: &str, event: &CalendarEvent) -> Result<(), SyncError>;

    async fn delete_event(&self, user_id: &str, external_id: &str) -> Result<(), SyncError>;
}

/// Forwards changes to the CRM's events API.
pub struct HttpEventSink {
    http_client: Client,
    base_url: String,
}

impl HttpEventSink {
    pub fn new(http_client: Client, base_url: String) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn check(response: &reqwest::Response, action: &str) -> Result<(), SyncError> {
        let status = response.status();
        if status.is_success() || (action == "delete" && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }
        Err(SyncError::TransientNetwork(format!(
            "event sink {} returned {}",
            action, status
        )))
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn upsert_event(&self, user_id: &str, event: &CalendarEvent) -> Result<(), SyncError> {
        let response = self
            .http_client
            .post(format!("{}/calendar-events", self.base_url))
            .json(&serde_json::json!({ "user_id": user_id, "event": event }))
            .send()
            .await
            .map_err(|e| SyncError::from_transport("event sink upsert failed", e))?;
        Self::check(&response, "upsert")
    }

    async fn delete_event(&self, user_id: &str, external_id: &str) -> Result<(), SyncError> {
        let response = self
            .http_client
            .delete(format!(
                "{}/calendar-events/{}",
                self.base_url,
                urlencoding::encode(external_id)
            ))
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(|e| SyncError::from_transport("event sink delete failed", e))?;
        Self::check(&response, "delete")
    }
}

/// Logs changes without persisting them. Used when no sink URL is configured.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn upsert_event(&self, user_id: &str, event: &CalendarEvent) -> Result<(), SyncError> {
        info!(
            user_id = %user_id,
            external_id = ?event.external_id,
            starts_at = %event.starts_at,
            "Calendar event changed"
        );
        Ok(())
    }

    async fn delete_event(&self, user_id: &str, external_id: &str) -> Result<(), SyncError> {
        info!(user_id = %user_id, external_id = %external_id, "Calendar event deleted");
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Calendar `events.list` client.
pub struct GoogleEventsClient {
    http_client: Client,
    base_url: String,
    calendar_id: String,
}

impl GoogleEventsClient {
    pub fn new(http_client: Client) -> Self {
        Self::with_base_url(http_client, GOOGLE_CALENDAR_API.to_string(), "primary".to_string())
    }

    pub fn with_base_url(http_client: Client, base_url: String, calendar_id: String) -> Self {
        Self {
            http_client,
            base_url,
            calendar_id,
        }
    }

    /// All events updated since `updated_min`, deleted ones included.
    pub async fn list_updated(
        &self,
        access_token: &str,
        updated_min: DateTime<Utc>,
    ) -> Result<Vec<GoogleEvent>, SyncError> {
        let url = format!(
            "{}/calendar/v3/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        );
        let updated_min = updated_min.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> = vec![
                ("updatedMin", updated_min.as_str()),
                ("showDeleted", "true"),
                ("singleEvents", "true"),
                ("maxResults", "250"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self
                .http_client
                .get(&url)
                .bearer_auth(access_token)
                .query(&query)
                .send()
                .await
                .map_err(|e| SyncError::from_transport("events list request failed", e))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SyncError::Refresh(format!(
                    "calendar API rejected the access token ({})",
                    status
                )));
            }
            if !status.is_success() {
                return Err(SyncError::TransientNetwork(format!(
                    "events list returned {}",
                    status
                )));
            }

            let page: EventsPage = response
                .json()
                .await
                .map_err(|e| SyncError::TransientNetwork(format!("malformed events page: {}", e)))?;

            events.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(events)
    }
}

/// Applies remote calendar changes for a user to an [`EventSink`].
///
/// Each pass lists events updated since the previous successful pass for that
/// user (or `lookback` on the first one).
pub struct CalendarReconciler {
    store: Arc<CredentialStore>,
    tokens: Arc<dyn TokenEndpoint>,
    events: GoogleEventsClient,
    sink: Arc<dyn EventSink>,
    lookback: Duration,
    last_synced: DashMap<String, DateTime<Utc>>,
}

impl CalendarReconciler {
    pub fn new(
        store: Arc<CredentialStore>,
        tokens: Arc<dyn TokenEndpoint>,
        events: GoogleEventsClient,
        sink: Arc<dyn EventSink>,
        lookback: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            events,
            sink,
            lookback,
            last_synced: DashMap::new(),
        }
    }

    pub fn last_synced(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.last_synced.get(user_id).map(|entry| *entry)
    }
}

#[async_trait]
impl Reconciler for CalendarReconciler {
    async fn reconcile(&self, job: &ReconcileJob) -> Result<ReconcileSummary, SyncError> {
        let started = Utc::now();
        let since = self
            .last_synced(&job.user_id)
            .unwrap_or(started - self.lookback);

        let credentials = ensure_fresh_access_token(&self.store, self.tokens.as_ref(), &job.user_id).await?;
        let listed = self.events.list_updated(&credentials.access_token, since).await?;
        debug!(user_id = %job.user_id, listed = listed.len(), since = %since, "Listed updated events");

        let mut summary = ReconcileSummary::default();
        for event in listed {
            match from_google_event(event) {
                Ok(EventChange::Upsert(event)) => {
                    self.sink.upsert_event(&job.user_id, &event).await?;
                    summary.upserted += 1;
                }
                Ok(EventChange::Delete { external_id }) => {
                    self.sink.delete_event(&job.user_id, &external_id).await?;
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(user_id = %job.user_id, error = %e, "Skipping unmappable event");
                    summary.skipped += 1;
                }
            }
        }

        self.last_synced.insert(job.user_id.clone(), started);
        Ok(summary)
    }
}
