use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crm_sync::session::SessionManager;
use std::sync::Arc;
use tracing::debug;

/// Supplies the bearer token for each trigger call.
#[async_trait]
pub trait BearerSource: Send + Sync {
    /// `None` when the service runs without an admin token.
    async fn bearer(&self) -> Result<Option<String>>;
}

/// A fixed admin token (or none).
pub struct StaticBearer(pub Option<String>);

#[async_trait]
impl BearerSource for StaticBearer {
    async fn bearer(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// The access token of a refreshed identity-provider session.
pub struct SessionBearer {
    manager: Arc<SessionManager>,
}

impl SessionBearer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl BearerSource for SessionBearer {
    async fn bearer(&self) -> Result<Option<String>> {
        let status = self.manager.validate().await;
        if status.needs_refresh {
            debug!("Session near expiry before trigger, refreshing");
            if !self.manager.refresh().await {
                return Err(anyhow!("session refresh failed, re-authentication required"));
            }
        }

        self.manager
            .access_token()
            .await
            .map(Some)
            .ok_or_else(|| anyhow!("no session held"))
    }
}
