//! Identity provider speaking the GoTrue token endpoint.

use super::{IdentityProvider, Session, SessionError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::RwLock;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// Holds one session and refreshes it via
/// `POST {base_url}/token?grant_type=refresh_token`.
pub struct HttpIdentityProvider {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    session: RwLock<Option<Session>>,
}

impl HttpIdentityProvider {
    pub fn new(http_client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            session: RwLock::new(None),
        }
    }

    /// Seed from a refresh token alone. The access token is empty and
    /// already expired, so the first validation asks for a refresh.
    pub fn with_refresh_token(self, refresh_token: String) -> Self {
        self.replace_session(Some(Session {
            access_token: String::new(),
            refresh_token,
            expires_at: Utc::now() - Duration::seconds(1),
        }));
        self
    }

    pub fn replace_session(&self, session: Option<Session>) {
        match self.session.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    fn held(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn current_session(&self) -> Option<Session> {
        self.held()
    }

    async fn refresh_session(&self) -> Result<Session, SessionError> {
        let current = self.held().ok_or(SessionError::NoSession)?;

        let url = format!("{}/token?grant_type=refresh_token", self.base_url);
        let mut request = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "refresh_token": current.refresh_token }));
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("token request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SessionError::Network(format!("identity provider returned {}", status)));
        }
        if !status.is_success() {
            let body: ErrorResponse = response.json().await.unwrap_or_default();
            let reason = body
                .error_description
                .or(body.msg)
                .or(body.error)
                .unwrap_or_else(|| status.to_string());
            return Err(SessionError::Rejected(reason));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Rejected(format!("malformed token response: {}", e)))?;

        let session = Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: crate::credentials::expiry_after(tokens.expires_in),
        };
        self.replace_session(Some(session.clone()));
        Ok(session)
    }
}
