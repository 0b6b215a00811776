//! OAuth provider configurations.
//!
//! Built once at startup from the environment. A service whose client id and
//! secret are absent is simply unavailable; a service configured with an
//! empty or malformed value is a startup error.

use crate::credentials::ServiceId;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth provider configuration for one service.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub service: ServiceId,

    /// Authorization endpoint URL
    pub auth_url: String,

    /// Token exchange and refresh endpoint URL
    pub token_url: String,

    /// Minimal scope set for the service
    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,

    /// Callback URL registered with the provider
    pub redirect_uri: String,
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("service", &self.service)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl OAuthProviderConfig {
    /// Build authorization URL for this provider with the given `state`.
    pub fn authorization_url(&self, state: &str) -> String {
        build_authorization_url(
            &self.auth_url,
            &self.client_id,
            &self.redirect_uri,
            &self.scopes,
            state,
        )
    }

    /// Load `CRM_SYNC_OAUTH_<SERVICE>_CLIENT_ID` / `_CLIENT_SECRET`.
    ///
    /// Returns `Ok(None)` when neither variable is set.
    pub fn from_env(service: ServiceId, callback_base_url: &str) -> Result<Option<Self>, SyncError> {
        let prefix = format!("CRM_SYNC_OAUTH_{}", service.as_str().to_uppercase());
        let client_id = std::env::var(format!("{}_CLIENT_ID", prefix)).ok();
        let client_secret = std::env::var(format!("{}_CLIENT_SECRET", prefix)).ok();

        match (client_id, client_secret) {
            (None, None) => Ok(None),
            (Some(client_id), Some(client_secret)) => {
                Self::for_service(service, client_id, client_secret, callback_base_url).map(Some)
            }
            _ => Err(SyncError::Configuration(format!(
                "{} requires both {}_CLIENT_ID and {}_CLIENT_SECRET",
                service, prefix, prefix
            ))),
        }
    }

    /// Google endpoints and scopes for `service`, validated.
    pub fn for_service(
        service: ServiceId,
        client_id: String,
        client_secret: String,
        callback_base_url: &str,
    ) -> Result<Self, SyncError> {
        if client_id.trim().is_empty() {
            return Err(SyncError::Configuration(format!("{}: client id is empty", service)));
        }
        if client_secret.trim().is_empty() {
            return Err(SyncError::Configuration(format!(
                "{}: client secret is empty",
                service
            )));
        }

        let redirect_uri = callback_url(callback_base_url, service);
        reqwest::Url::parse(&redirect_uri).map_err(|e| {
            SyncError::Configuration(format!("{}: invalid redirect URI '{}': {}", service, redirect_uri, e))
        })?;

        Ok(Self {
            service,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: scopes_for(service).iter().map(|s| s.to_string()).collect(),
            client_id,
            client_secret,
            redirect_uri,
        })
    }
}

/// Minimal scopes: calendar events read/write, or send-only mail.
pub fn scopes_for(service: ServiceId) -> &'static [&'static str] {
    match service {
        ServiceId::GoogleCalendar => &["https://www.googleapis.com/auth/calendar.events"],
        ServiceId::Gmail => &["https://www.googleapis.com/auth/gmail.send"],
    }
}

/// Public callback URL for a service's OAuth redirect.
pub fn callback_url(callback_base_url: &str, service: ServiceId) -> String {
    format!(
        "{}/api/integrations/{}/oauth/callback",
        callback_base_url.trim_end_matches('/'),
        service
    )
}

/// Authorization-code URL with offline access.
///
/// `prompt=consent` makes Google issue a refresh token even when the user
/// has already granted access once.
pub fn build_authorization_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> String {
    let scopes = scopes.join(" ");
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
        auth_url,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(state)
    )
}
