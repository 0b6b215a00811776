use anyhow::{Context, Result};
use crm_sync::config::{AppConfig, Secrets};
use crm_sync::session::{
    new_refresh_lock, run_session_monitor, HttpIdentityProvider, SessionEvent, SessionManager,
};
use renewal_worker::{run_renewal_schedule, BearerSource, RenewalClient, SessionBearer, StaticBearer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renewal_worker=info,crm_sync=info".into()),
        )
        .init();

    info!("Renewal worker starting...");

    let config = AppConfig::load(std::env::var("CRM_SYNC_CONFIG").ok().as_deref())?;
    let secrets = Secrets::from_env();

    let api_url = std::env::var("CRM_SYNC_API_URL")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());

    let interval_secs: u64 = std::env::var("RENEWAL_INTERVAL_SECONDS")
        .unwrap_or_else(|_| "3600".to_string())
        .parse()
        .context("RENEWAL_INTERVAL_SECONDS must be a number of seconds")?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let identity_url = config.session.identity_url.clone();
    let refresh_token = std::env::var("RENEWAL_WORKER_REFRESH_TOKEN").ok();

    // Session mode: the service accepts identity tokens from users listed in renewal_callers
    let (bearer, mut session_events): (Box<dyn BearerSource>, Option<mpsc::Receiver<SessionEvent>>) =
        match (identity_url, refresh_token) {
            (Some(identity_url), Some(refresh_token)) => {
                let provider = HttpIdentityProvider::new(
                    http_client.clone(),
                    identity_url,
                    secrets.identity_api_key.clone(),
                )
                .with_refresh_token(refresh_token);
                let manager = Arc::new(SessionManager::new(
                    Arc::new(provider),
                    new_refresh_lock(),
                    config.session.settings(),
                ));

                if !manager.refresh().await {
                    anyhow::bail!("Initial session refresh failed, check RENEWAL_WORKER_REFRESH_TOKEN");
                }

                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(run_session_monitor(
                    manager.clone(),
                    config.session.monitor_interval(),
                    tx,
                ));
                info!("Using identity-provider session for the renewal trigger");
                (Box::new(SessionBearer::new(manager)) as Box<dyn BearerSource>, Some(rx))
            }
            _ => {
                let admin_token = secrets.admin_token.clone();
                if admin_token.is_none() {
                    warn!("CRM_SYNC_ADMIN_TOKEN not set, calling the renewal trigger without a bearer");
                }
                (Box::new(StaticBearer(admin_token)) as Box<dyn BearerSource>, None)
            }
        };

    info!(api_url = %api_url, interval_secs, "Configuration loaded");

    let schedule = tokio::spawn(run_renewal_schedule(
        RenewalClient::new(http_client, api_url),
        bearer,
        Duration::from_secs(interval_secs),
    ));

    let session_expired = async {
        match session_events.as_mut() {
            Some(rx) => {
                while let Some(event) = rx.recv().await {
                    match event {
                        SessionEvent::Refreshed { expires_at } => {
                            info!(expires_at = ?expires_at, "Worker session refreshed");
                        }
                        SessionEvent::Expired { reason } => {
                            error!(reason = ?reason, "Worker session expired");
                            return;
                        }
                    }
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = session_expired => warn!("Stopping: re-authentication required"),
    }

    schedule.abort();
    info!("Renewal worker stopped");
    Ok(())
}
