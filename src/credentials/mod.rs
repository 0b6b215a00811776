//! Encrypted credential records for external integrations.
//!
//! One [`CredentialRecord`] exists per user per [`ServiceId`]. It carries the
//! OAuth token pair and, for services with push sync, the webhook channel
//! triple. Records are soft-deleted (`is_active = false`) on disconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - upsert / token update / webhook ops   │
//! │  - Transparent encryption/decryption     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, unique nonce per token   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - UNIQUE(user_id, service)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use crm_sync::credentials::{CredentialStore, Credentials, ServiceId};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("CRM_SYNC_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("credentials.db", &encryption_key)?;
//!
//! let creds = Credentials {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     expires_at: Utc::now() + Duration::hours(1),
//! };
//! store.upsert("user1", ServiceId::GoogleCalendar, &creds)?;
//!
//! if let Some(record) = store.get_active("user1", ServiceId::GoogleCalendar)? {
//!     println!("Connected until {}", record.credentials.expires_at);
//! }
//!
//! store.deactivate("user1", ServiceId::GoogleCalendar)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod encryption;
mod storage;

pub use storage::CredentialStore;

pub use encryption::{validate_key, Sealed, TokenCipher};

/// External integration a credential belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    GoogleCalendar,
    Gmail,
}

impl ServiceId {
    pub const ALL: [ServiceId; 2] = [ServiceId::GoogleCalendar, ServiceId::Gmail];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::GoogleCalendar => "google_calendar",
            ServiceId::Gmail => "gmail",
        }
    }

    /// Whether the service keeps a push-notification channel alive.
    pub fn supports_webhooks(&self) -> bool {
        matches!(self, ServiceId::GoogleCalendar)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_calendar" => Ok(ServiceId::GoogleCalendar),
            "gmail" => Ok(ServiceId::Gmail),
            other => Err(UnknownService(other.to_string())),
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("unknown service '{0}'")]
pub struct UnknownService(pub String);

/// OAuth token pair for one connection.
///
/// `Debug` never prints the tokens; use [`mask_token`] for diagnostics.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Short-lived access token
    pub access_token: String,

    /// Long-lived refresh token (absent if the provider did not grant one)
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// True if the access token expires within `leeway` from now.
    pub fn expires_within(&self, leeway: chrono::Duration) -> bool {
        self.expires_at - Utc::now() <= leeway
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &mask_token(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A live push-notification channel. Only valid as a complete triple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Webhook lifecycle state derived from a record's three webhook columns.
#[derive(Clone, Debug, PartialEq)]
pub enum WebhookState {
    Unregistered,
    Active(WebhookChannel),
    /// Some but not all webhook fields are set; must be re-registered.
    Inconsistent,
}

/// Persisted credential record for one user's connection to one service.
#[derive(Clone, Debug)]
pub struct CredentialRecord {
    pub user_id: String,
    pub service: ServiceId,
    pub credentials: Credentials,
    pub is_active: bool,
    pub webhook_channel_id: Option<String>,
    pub webhook_resource_id: Option<String>,
    pub webhook_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn webhook_state(&self) -> WebhookState {
        match (
            &self.webhook_channel_id,
            &self.webhook_resource_id,
            self.webhook_expires_at,
        ) {
            (None, None, None) => WebhookState::Unregistered,
            (Some(channel_id), Some(resource_id), Some(expires_at)) => {
                WebhookState::Active(WebhookChannel {
                    channel_id: channel_id.clone(),
                    resource_id: resource_id.clone(),
                    expires_at,
                })
            }
            _ => WebhookState::Inconsistent,
        }
    }
}

/// Longest token lifetime accepted from a provider.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 366 * 24 * 3600;

/// Absolute expiry for a provider's `expires_in`, clamped to
/// `0..=MAX_TOKEN_LIFETIME_SECS`.
pub fn expiry_after(expires_in_secs: i64) -> DateTime<Utc> {
    let secs = expires_in_secs.clamp(0, MAX_TOKEN_LIFETIME_SECS);
    Utc::now() + chrono::Duration::seconds(secs)
}

/// Truncate a secret for logs: first 6 characters followed by an ellipsis.
pub fn mask_token(token: &str) -> String {
    const VISIBLE: usize = 6;
    if token.chars().count() <= VISIBLE {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(VISIBLE).collect();
    format!("{}...", prefix)
}
