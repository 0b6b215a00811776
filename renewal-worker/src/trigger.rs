use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

/// One user's line in the renewal report.
#[derive(Debug, Deserialize)]
pub struct UserReport {
    pub user_id: String,
    pub status: String,
    #[serde(default)]
    pub hours_remaining: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reconnect_required: bool,
}

#[derive(Debug, Deserialize)]
pub struct RenewSummary {
    pub renewed: usize,
    pub still_valid: usize,
    pub failed: usize,
    #[serde(default)]
    pub results: Vec<UserReport>,
}

/// HTTP client for the service's renewal trigger.
pub struct RenewalClient {
    http_client: Client,
    api_url: String,
}

impl RenewalClient {
    pub fn new(http_client: Client, api_url: String) -> Self {
        Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Renew every active user's channel, or only `user_id`'s.
    pub async fn trigger(&self, bearer: Option<&str>, user_id: Option<&str>) -> Result<RenewSummary> {
        let url = format!("{}/api/calendar/webhook/renew", self.api_url);

        let mut request = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "user_id": user_id }));
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Renewal trigger returned {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse renewal report")
    }
}
