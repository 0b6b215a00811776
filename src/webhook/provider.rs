//! Push-notification channel API (Google Calendar "watch").

use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com";

/// Parameters for opening a channel.
#[derive(Clone, Debug)]
pub struct WatchRequest {
    /// Unique per registration attempt
    pub channel_id: String,
    /// Public URL the provider will POST notifications to
    pub callback_url: String,
    /// Echoed back on every notification (the user id)
    pub channel_token: String,
    /// Requested lifetime; the provider may grant less
    pub ttl_seconds: i64,
}

/// What the provider granted.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelGrant {
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PushChannelProvider: Send + Sync {
    async fn watch(&self, access_token: &str, request: &WatchRequest) -> Result<ChannelGrant, SyncError>;

    async fn stop(&self, access_token: &str, channel_id: &str, resource_id: &str) -> Result<(), SyncError>;
}

#[derive(Serialize)]
struct WatchBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    address: &'a str,
    token: &'a str,
    params: WatchParams,
}

#[derive(Serialize)]
struct WatchParams {
    ttl: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    resource_id: String,
    /// Milliseconds since the epoch, as a string
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopBody<'a> {
    id: &'a str,
    resource_id: &'a str,
}

/// Google Calendar events-watch client for one calendar.
pub struct GoogleCalendarChannels {
    http_client: Client,
    base_url: String,
    calendar_id: String,
}

impl GoogleCalendarChannels {
    /// Watch the user's primary calendar.
    pub fn new(http_client: Client) -> Self {
        Self::with_base_url(http_client, GOOGLE_CALENDAR_API.to_string(), "primary".to_string())
    }

    /// Custom base URL (for testing with a mock server).
    pub fn with_base_url(http_client: Client, base_url: String, calendar_id: String) -> Self {
        Self {
            http_client,
            base_url,
            calendar_id,
        }
    }
}

#[async_trait]
impl PushChannelProvider for GoogleCalendarChannels {
    async fn watch(&self, access_token: &str, request: &WatchRequest) -> Result<ChannelGrant, SyncError> {
        let url = format!(
            "{}/calendar/v3/calendars/{}/events/watch",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&WatchBody {
                id: &request.channel_id,
                kind: "web_hook",
                address: &request.callback_url,
                token: &request.channel_token,
                params: WatchParams {
                    ttl: request.ttl_seconds.to_string(),
                },
            })
            .send()
            .await
            .map_err(|e| SyncError::WebhookRegistration(format!("watch request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::WebhookRegistration(format!(
                "watch rejected with status {}: {}",
                status, body
            )));
        }

        let channel: ChannelResponse = response
            .json()
            .await
            .map_err(|e| SyncError::WebhookRegistration(format!("malformed watch response: {}", e)))?;

        Ok(ChannelGrant {
            resource_id: channel.resource_id,
            expires_at: channel.expiration.as_deref().and_then(parse_expiration_millis),
        })
    }

    async fn stop(&self, access_token: &str, channel_id: &str, resource_id: &str) -> Result<(), SyncError> {
        let url = format!("{}/calendar/v3/channels/stop", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&StopBody {
                id: channel_id,
                resource_id,
            })
            .send()
            .await
            .map_err(|e| SyncError::from_transport("channel stop request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::WebhookRegistration(format!(
                "channel stop rejected with status {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

fn parse_expiration_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = raw.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn request() -> WatchRequest {
        WatchRequest {
            channel_id: "chan-1".to_string(),
            callback_url: "https://crm.example.com/api/calendar/webhook".to_string(),
            channel_token: "user-42".to_string(),
            ttl_seconds: 604_800,
        }
    }

    #[test]
    fn test_parse_expiration_millis() {
        let parsed = parse_expiration_millis("1426325213000").unwrap();
        assert_eq!(parsed.timestamp(), 1_426_325_213);
        assert!(parse_expiration_millis("soon").is_none());
    }

    #[tokio::test]
    async fn test_watch_sends_channel_and_parses_grant() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/calendar/v3/calendars/primary/events/watch")
            .match_header("authorization", "Bearer ya29.token")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "id": "chan-1",
                "type": "web_hook",
                "address": "https://crm.example.com/api/calendar/webhook",
                "token": "user-42",
                "params": { "ttl": "604800" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "kind": "api#channel",
                    "id": "chan-1",
                    "resourceId": "o3hgv1538sdjfh",
                    "resourceUri": "https://www.googleapis.com/calendar/v3/calendars/primary/events",
                    "token": "user-42",
                    "expiration": "1426325213000"
                }"#,
            )
            .create_async()
            .await;

        let channels = GoogleCalendarChannels::with_base_url(
            Client::new(),
            server.url(),
            "primary".to_string(),
        );
        let grant = channels.watch("ya29.token", &request()).await.unwrap();

        assert_eq!(grant.resource_id, "o3hgv1538sdjfh");
        assert_eq!(grant.expires_at.unwrap().timestamp(), 1_426_325_213);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_watch_rejection_is_registration_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/calendar/v3/calendars/primary/events/watch")
            .with_status(401)
            .with_body(r#"{"error":{"code":401,"message":"Invalid Credentials"}}"#)
            .create_async()
            .await;

        let channels = GoogleCalendarChannels::with_base_url(
            Client::new(),
            server.url(),
            "primary".to_string(),
        );
        let err = channels.watch("expired", &request()).await.unwrap_err();
        assert!(matches!(err, SyncError::WebhookRegistration(ref m) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_stop_channel() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/calendar/v3/channels/stop")
            .match_body(Matcher::Json(serde_json::json!({
                "id": "chan-1",
                "resourceId": "res-1"
            })))
            .with_status(204)
            .create_async()
            .await;

        let channels = GoogleCalendarChannels::with_base_url(
            Client::new(),
            server.url(),
            "primary".to_string(),
        );
        channels.stop("ya29.token", "chan-1", "res-1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_channel_errors() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/calendar/v3/channels/stop")
            .with_status(404)
            .with_body("Channel 'chan-1' not found for project")
            .create_async()
            .await;

        let channels = GoogleCalendarChannels::with_base_url(
            Client::new(),
            server.url(),
            "primary".to_string(),
        );
        assert!(channels.stop("ya29.token", "chan-1", "res-1").await.is_err());
    }
}
