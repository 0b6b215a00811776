//! OAuth 2.0 authorization-code flow with offline access.
//!
//! 1. User clicks "Connect" in the CRM
//! 2. GET /api/integrations/:service/oauth/start → redirect to Google
//! 3. User consents on Google's site
//! 4. Google redirects to /api/integrations/:service/oauth/callback
//! 5. Code is exchanged for a token pair, stored encrypted
//! 6. Later requests call [`ensure_fresh_access_token`] before using the token

mod client;
mod provider;
mod state;
mod tokens;

pub use client::{OAuthClient, TokenEndpoint, TokenGrant};
pub use provider::{
    build_authorization_url, callback_url, scopes_for, OAuthProviderConfig, GOOGLE_AUTH_URL,
    GOOGLE_TOKEN_URL,
};
pub use state::{run_state_cleanup, PendingAuthorization, StateManager};
pub use tokens::{ensure_fresh_access_token, REFRESH_LEEWAY_SECS};

use crate::credentials::ServiceId;
use crate::error::SyncError;
use std::collections::HashMap;
use std::sync::Arc;

/// Token endpoints for every configured service, built eagerly at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    endpoints: HashMap<ServiceId, Arc<OAuthClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every service from the environment.
    ///
    /// Services without credentials are skipped with a warning; partially or
    /// invalidly configured services fail startup.
    pub fn from_env(callback_base_url: &str, http_client: reqwest::Client) -> Result<Self, SyncError> {
        let mut registry = Self::new();
        for service in ServiceId::ALL {
            match OAuthProviderConfig::from_env(service, callback_base_url)? {
                Some(config) => {
                    tracing::info!(service = %service, redirect_uri = %config.redirect_uri, "OAuth provider configured");
                    registry.insert(OAuthClient::new(config, http_client.clone()));
                }
                None => {
                    tracing::warn!(service = %service, "OAuth provider not configured, integration unavailable");
                }
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, client: OAuthClient) {
        self.endpoints.insert(client.config().service, Arc::new(client));
    }

    pub fn get(&self, service: ServiceId) -> Option<Arc<OAuthClient>> {
        self.endpoints.get(&service).cloned()
    }

    pub fn is_configured(&self, service: ServiceId) -> bool {
        self.endpoints.contains_key(&service)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        assert!(!registry.is_configured(ServiceId::GoogleCalendar));

        let config = OAuthProviderConfig::for_service(
            ServiceId::GoogleCalendar,
            "id".to_string(),
            "secret".to_string(),
            "http://localhost:3000",
        )
        .unwrap();
        registry.insert(OAuthClient::new(config, reqwest::Client::new()));

        assert!(registry.is_configured(ServiceId::GoogleCalendar));
        assert!(registry.get(ServiceId::Gmail).is_none());
        assert_eq!(
            registry.get(ServiceId::GoogleCalendar).unwrap().service(),
            ServiceId::GoogleCalendar
        );
    }
}
