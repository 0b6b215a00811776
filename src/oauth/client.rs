//! OAuth token endpoint client.
//!
//! Exchanges authorization codes for token pairs and refreshes access tokens.
//! The two paths are kept apart: a code is single-use and short-lived, while a
//! refresh token is reused for the lifetime of the connection.

use super::provider::OAuthProviderConfig;
use crate::credentials::{Credentials, ServiceId};
use crate::error::SyncError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Tokens returned by the token endpoint.
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenGrant {
    /// Convert to stored credentials, falling back to `previous_refresh` when
    /// the provider did not rotate the refresh token.
    pub fn into_credentials(self, previous_refresh: Option<String>) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: crate::credentials::expiry_after(self.expires_in),
        }
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &crate::credentials::mask_token(&self.access_token))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token endpoint operations, one implementation per configured service.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn service(&self) -> ServiceId;

    /// Exchange a single-use authorization code.
    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant, SyncError>;

    /// Mint a new access token. A rejected refresh token is terminal.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, SyncError>;
}

/// Standard OAuth 2.0 token response
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Standard OAuth 2.0 error body
#[derive(Deserialize, Debug, Default)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenErrorResponse {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn describe(&self, status: StatusCode) -> String {
        match (&self.error, &self.error_description) {
            (e, Some(d)) if !e.is_empty() => format!("{} ({}): {}", e, status, d),
            (e, None) if !e.is_empty() => format!("{} ({})", e, status),
            _ => format!("status {}", status),
        }
    }
}

/// HTTP client for one provider's token endpoint.
pub struct OAuthClient {
    config: OAuthProviderConfig,
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthProviderConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    async fn post_token_form(
        &self,
        form: &[(&str, &str)],
    ) -> Result<Result<TokenGrant, (StatusCode, TokenErrorResponse)>, SyncError> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| SyncError::from_transport("token endpoint unreachable", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(Err((status, TokenErrorResponse::parse(&body))));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::from_transport("malformed token response", e))?;

        Ok(Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        }))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    fn service(&self) -> ServiceId {
        self.config.service
    }

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant, SyncError> {
        tracing::debug!(
            service = %self.config.service,
            token_url = %self.config.token_url,
            "Exchanging authorization code"
        );

        let result = self
            .post_token_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        match result {
            Ok(grant) => {
                tracing::debug!(
                    service = %self.config.service,
                    has_refresh_token = grant.refresh_token.is_some(),
                    expires_in = grant.expires_in,
                    "Authorization code exchanged"
                );
                Ok(grant)
            }
            Err((status, body)) if status.is_server_error() => Err(SyncError::TransientNetwork(
                format!("token endpoint error: {}", body.describe(status)),
            )),
            Err((status, body)) => Err(SyncError::TokenExchange(body.describe(status))),
        }
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, SyncError> {
        let result = self
            .post_token_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        match result {
            Ok(grant) => Ok(grant),
            Err((status, body)) if status.is_server_error() => Err(SyncError::TransientNetwork(
                format!("token endpoint error: {}", body.describe(status)),
            )),
            Err((status, body)) => Err(SyncError::Refresh(body.describe(status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use mockito::{Matcher, Server};

    fn client_for(server: &Server) -> OAuthClient {
        let mut config = OAuthProviderConfig::for_service(
            ServiceId::GoogleCalendar,
            "client-id".to_string(),
            "client-secret".to_string(),
            "http://localhost:3000",
        )
        .unwrap();
        config.token_url = format!("{}/token", server.url());
        OAuthClient::new(config, reqwest::Client::new())
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "ya29.a0Af",
            "refresh_token": "1//0gRef",
            "expires_in": 3599,
            "token_type": "Bearer",
            "scope": "https://www.googleapis.com/auth/calendar.events"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "ya29.a0Af");
        assert_eq!(response.refresh_token, Some("1//0gRef".to_string()));
        assert_eq!(response.expires_in, Some(3599));
    }

    #[test]
    fn test_error_body_description() {
        let body = TokenErrorResponse::parse(
            r#"{"error":"invalid_grant","error_description":"Bad Request"}"#,
        );
        assert_eq!(
            body.describe(StatusCode::BAD_REQUEST),
            "invalid_grant (400 Bad Request): Bad Request"
        );

        let body = TokenErrorResponse::parse("<html>oops</html>");
        assert_eq!(body.describe(StatusCode::BAD_GATEWAY), "status 502 Bad Gateway");
    }

    #[test]
    fn test_grant_keeps_previous_refresh_token() {
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: 3600,
        };
        let creds = grant.into_credentials(Some("old-refresh".to_string()));
        assert_eq!(creds.refresh_token, Some("old-refresh".to_string()));
        assert!(creds.expires_at > Utc::now() + Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "abc123".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.new","refresh_token":"1//r","expires_in":3599}"#)
            .create_async()
            .await;

        let grant = client_for(&server)
            .exchange_code_for_tokens("abc123")
            .await
            .unwrap();

        assert_eq!(grant.access_token, "ya29.new");
        assert_eq!(grant.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(grant.expires_in, 3599);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Malformed auth code."}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .exchange_code_for_tokens("used-code")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::TokenExchange(ref msg) if msg.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_refresh_with_revoked_token_is_refresh_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .refresh_access_token("revoked")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Refresh(_)));
        assert!(err.requires_reconnect());
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .create_async()
            .await;

        let err = client_for(&server)
            .refresh_access_token("1//r")
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refresh_defaults_missing_expiry() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.refreshed"}"#)
            .create_async()
            .await;

        let grant = client_for(&server).refresh_access_token("1//r").await.unwrap();
        assert_eq!(grant.access_token, "ya29.refreshed");
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in, DEFAULT_EXPIRES_IN_SECS);
    }

    #[tokio::test]
    async fn test_refresh_with_oversized_expiry() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.long","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let grant = client_for(&server).refresh_access_token("1//r").await.unwrap();
        let creds = grant.into_credentials(Some("1//r".to_string()));
        assert!(creds.expires_at > Utc::now() + Duration::days(365));
        assert!(creds.expires_at <= Utc::now() + Duration::days(366));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let mut config = OAuthProviderConfig::for_service(
            ServiceId::Gmail,
            "id".to_string(),
            "secret".to_string(),
            "http://localhost:3000",
        )
        .unwrap();
        config.token_url = "http://127.0.0.1:1/token".to_string();
        let client = OAuthClient::new(config, reqwest::Client::new());

        let err = client.refresh_access_token("1//r").await.unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
    }
}
