use async_trait::async_trait;
use axum::http::HeaderMap;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum TokenError {
    /// Authorization header not present
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    /// Token is empty string
    #[error("Authorization token is empty")]
    Empty,
}

/// Authentication errors
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum AuthError {
    /// Missing or malformed Authorization header
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    /// Token well-formed but not recognized
    #[error("Token not recognized")]
    Unauthorized,
    /// Identity provider could not be reached
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Maps a CRM session token to the user it belongs to.
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<String, AuthError>;
}

/// Resolve the calling user from request headers.
pub async fn authenticate(headers: &HeaderMap, users: &dyn UserResolver) -> Result<String, AuthError> {
    let token = extract_bearer_token(headers).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    users.resolve(&token).await
}

/// Authorize a call to a service-level trigger. Accepts the admin token, or
/// a token the identity provider resolves to one of `callers`. With neither
/// configured every caller is accepted.
pub async fn authorize_trigger(
    headers: &HeaderMap,
    admin_token: Option<&str>,
    users: &dyn UserResolver,
    callers: &[String],
) -> Result<(), AuthError> {
    if admin_token.is_none() && callers.is_empty() {
        return Ok(());
    }

    let token = extract_bearer_token(headers).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    if let Some(expected) = admin_token {
        if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            return Ok(());
        }
    }
    if callers.is_empty() {
        return Err(AuthError::Unauthorized);
    }

    let user_id = users.resolve(&token).await?;
    if callers.iter().any(|caller| caller == &user_id) {
        Ok(())
    } else {
        Err(AuthError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// In-memory token table.
#[derive(Clone, Default)]
pub struct StaticUserResolver {
    tokens: Arc<DashMap<String, String>>,
}

impl StaticUserResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, user_id: &str) {
        self.tokens.insert(token.to_string(), user_id.to_string());
    }
}

#[async_trait]
impl UserResolver for StaticUserResolver {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::Unauthorized)
    }
}

#[derive(Deserialize)]
struct IdentityUser {
    id: String,
}

/// Resolves users through the identity provider's `GET {base_url}/user`.
pub struct IdentityUserResolver {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl IdentityUserResolver {
    pub fn new(http_client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl UserResolver for IdentityUserResolver {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        let mut request = self
            .http_client
            .get(format!("{}/user", self.base_url))
            .bearer_auth(token);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let user: IdentityUser = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Unavailable(format!("malformed user response: {}", e)))?;
                Ok(user.id)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized),
            status => Err(AuthError::Unavailable(format!("identity provider returned {}", status))),
        }
    }
}
