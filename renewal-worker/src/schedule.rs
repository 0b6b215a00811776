use crate::auth::BearerSource;
use crate::trigger::{RenewSummary, RenewalClient};
use anyhow::Result;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

/// One renewal pass, with per-user outcomes logged.
pub async fn run_renewal_once(client: &RenewalClient, bearer: &dyn BearerSource) -> Result<RenewSummary> {
    let token = bearer.bearer().await?;
    let summary = client.trigger(token.as_deref(), None).await?;

    for report in &summary.results {
        match report.status.as_str() {
            "failed" if report.reconnect_required => warn!(
                user_id = %report.user_id,
                error = report.error.as_deref().unwrap_or(""),
                "Webhook renewal needs the user to reconnect"
            ),
            "failed" => warn!(
                user_id = %report.user_id,
                error = report.error.as_deref().unwrap_or(""),
                "Webhook renewal failed, will retry next pass"
            ),
            status => info!(
                user_id = %report.user_id,
                status = %status,
                hours_remaining = ?report.hours_remaining,
                expires_at = ?report.expires_at,
                "Webhook checked"
            ),
        }
    }

    info!(
        renewed = summary.renewed,
        still_valid = summary.still_valid,
        failed = summary.failed,
        "Renewal pass complete"
    );
    Ok(summary)
}

/// Run a pass immediately, then once per `interval`, forever. A failed pass
/// is logged and retried on the next tick.
pub async fn run_renewal_schedule(client: RenewalClient, bearer: Box<dyn BearerSource>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = run_renewal_once(&client, bearer.as_ref()).await {
            error!(error = %e, "Renewal pass failed");
        }
    }
}
