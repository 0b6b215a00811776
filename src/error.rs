//! Error taxonomy for the integration core.
//!
//! Every fallible operation in `oauth`, `webhook` and `sync` returns
//! [`SyncError`]. HTTP handlers degrade these into redirects or JSON bodies;
//! nothing here is ever shown to a provider.

use crate::credentials::ServiceId;

/// Errors raised by the token and webhook lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Missing or invalid client id, secret, or redirect URI. Fatal, not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider rejected an authorization code (expired, reused, redirect mismatch).
    #[error("token exchange rejected: {0}")]
    TokenExchange(String),

    /// Provider rejected a refresh token. The user must reconnect.
    #[error("token refresh rejected, reconnect required: {0}")]
    Refresh(String),

    /// Network-class failure talking to a provider. Safe to retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Watch channel could not be created. Caller may retry on the next pass.
    #[error("webhook registration failed: {0}")]
    WebhookRegistration(String),

    /// A callback or push notification could not be matched to a user.
    #[error("attribution failed: {0}")]
    Attribution(String),

    /// No active credential record exists.
    #[error("{service} is not connected for user {user_id}")]
    NotConnected { user_id: String, service: ServiceId },

    /// Credential store failure.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// True when the stored credential can no longer be used and a new OAuth
    /// flow is the only way forward.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, SyncError::Refresh(_) | SyncError::NotConnected { .. })
    }

    /// True for failures worth retrying later without user involvement.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::WebhookRegistration(_)
        )
    }

    /// Classify a reqwest send failure.
    pub(crate) fn from_transport(context: &str, err: reqwest::Error) -> Self {
        SyncError::TransientNetwork(format!("{}: {}", context, err))
    }
}
