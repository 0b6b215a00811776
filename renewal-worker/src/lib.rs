//! Scheduled webhook renewal for crm-sync.
//!
//! Google push channels live at most seven days. This worker calls the
//! service's renewal trigger on a fixed interval so every channel is replaced
//! before it lapses:
//!
//! ```text
//!   renewal-worker ──(hourly)──> POST /api/calendar/webhook/renew
//!                                     │
//!                                     └─> check_and_renew() per active user
//! ```
//!
//! The bearer token is either a static admin token or the access token of an
//! identity-provider session kept alive by
//! [`SessionManager`](crm_sync::session::SessionManager).

pub mod auth;
pub mod schedule;
pub mod trigger;

pub use auth::{BearerSource, SessionBearer, StaticBearer};
pub use schedule::{run_renewal_schedule, run_renewal_once};
pub use trigger::{RenewSummary, RenewalClient, UserReport};
