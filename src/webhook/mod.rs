//! Webhook subscription lifecycle: register, renew and tear down the push
//! channel that delivers calendar change notifications.
//!
//! A credential record's webhook columns move between three states
//! ([`WebhookState`](crate::credentials::WebhookState)):
//!
//! ```text
//!  Unregistered --register--> Active --expires within 24h--> renew --> Active
//!        ^                      |
//!        +------disconnect------+
//! ```
//!
//! `Inconsistent` (some columns set) is treated like `Unregistered`.

mod locks;
mod manager;
mod provider;

pub use locks::KeyedLocks;
pub use manager::{
    RenewalOutcome, UserRenewal, WebhookManager, WebhookSettings, DEFAULT_RENEWAL_THRESHOLD_HOURS,
    MAX_CHANNEL_TTL_DAYS,
};
pub use provider::{
    ChannelGrant, GoogleCalendarChannels, PushChannelProvider, WatchRequest, GOOGLE_CALENDAR_API,
};
