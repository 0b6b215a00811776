//! Access-token freshness for stored credentials.

use super::client::TokenEndpoint;
use crate::credentials::{mask_token, CredentialStore, Credentials};
use crate::error::SyncError;
use chrono::Duration;
use tracing::{info, warn};

/// Tokens expiring within this window are refreshed before use.
pub const REFRESH_LEEWAY_SECS: i64 = 60;

/// Return usable credentials for `user_id`, refreshing the access token first
/// if it is expired or about to expire.
///
/// Always re-reads the record; renewal and user requests mutate it
/// independently. The refreshed token is persisted before returning.
pub async fn ensure_fresh_access_token(
    store: &CredentialStore,
    endpoint: &dyn TokenEndpoint,
    user_id: &str,
) -> Result<Credentials, SyncError> {
    let service = endpoint.service();
    let record = store
        .get_active(user_id, service)?
        .ok_or_else(|| SyncError::NotConnected {
            user_id: user_id.to_string(),
            service,
        })?;

    let current = record.credentials;
    if !current.expires_within(Duration::seconds(REFRESH_LEEWAY_SECS)) {
        return Ok(current);
    }

    let refresh_token = current.refresh_token.clone().ok_or_else(|| {
        SyncError::Refresh(format!("no refresh token stored for {} / {}", user_id, service))
    })?;

    info!(
        user_id = %user_id,
        service = %service,
        access_token = %mask_token(&current.access_token),
        "Access token expired, refreshing"
    );

    let grant = endpoint
        .refresh_access_token(&refresh_token)
        .await
        .map_err(|e| {
            warn!(user_id = %user_id, service = %service, error = %e, "Token refresh failed");
            e
        })?;

    let refreshed = grant.into_credentials(Some(refresh_token));
    if !store.update_tokens(user_id, service, &refreshed)? {
        // Disconnected while the refresh was in flight
        return Err(SyncError::NotConnected {
            user_id: user_id.to_string(),
            service,
        });
    }

    info!(
        user_id = %user_id,
        service = %service,
        expires_at = %refreshed.expires_at,
        "Access token refreshed"
    );

    Ok(refreshed)
}
