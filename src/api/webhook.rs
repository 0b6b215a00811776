use crate::auth::{authorize_trigger, AuthError, UserResolver};
use crate::error::SyncError;
use crate::sync::{Notification, NotificationOutcome, SyncOrchestrator};
use crate::webhook::{RenewalOutcome, UserRenewal, WebhookManager};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    BadRequest(String),
    Unauthorized(String),
    ServiceUnavailable(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unavailable(msg) => AppError::ServiceUnavailable(msg),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

/// Shared application state for webhook delivery and renewal
#[derive(Clone)]
pub struct WebhookAppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub webhooks: Option<Arc<WebhookManager>>,
    /// Accepted on the renewal trigger
    pub admin_token: Option<String>,
    pub users: Arc<dyn UserResolver>,
    /// Identity-provider users also accepted on the renewal trigger
    pub renewal_callers: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct RenewRequest {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    StillValid,
    Renewed,
    Failed,
}

#[derive(Serialize, Debug)]
pub struct RenewalReport {
    pub user_id: String,
    pub status: RenewalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The user must go through OAuth again
    pub reconnect_required: bool,
}

impl From<UserRenewal> for RenewalReport {
    fn from(renewal: UserRenewal) -> Self {
        let mut report = RenewalReport {
            user_id: renewal.user_id,
            status: RenewalStatus::Failed,
            hours_remaining: None,
            expires_at: None,
            error: None,
            reconnect_required: false,
        };
        match renewal.result {
            Ok(RenewalOutcome::StillValid { hours_remaining }) => {
                report.status = RenewalStatus::StillValid;
                report.hours_remaining = Some(hours_remaining);
            }
            Ok(RenewalOutcome::Renewed(channel)) => {
                report.status = RenewalStatus::Renewed;
                report.expires_at = Some(channel.expires_at);
            }
            Err(e) => {
                report.reconnect_required = e.requires_reconnect();
                report.error = Some(e.to_string());
            }
        }
        report
    }
}

#[derive(Serialize, Debug)]
pub struct RenewResponse {
    pub renewed: usize,
    pub still_valid: usize,
    pub failed: usize,
    pub results: Vec<RenewalReport>,
}

impl RenewResponse {
    fn from_reports(results: Vec<RenewalReport>) -> Self {
        let count = |status: RenewalStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            renewed: count(RenewalStatus::Renewed),
            still_valid: count(RenewalStatus::StillValid),
            failed: count(RenewalStatus::Failed),
            results,
        }
    }
}

pub fn create_webhook_router(state: WebhookAppState) -> Router {
    Router::new()
        .route("/api/calendar/webhook", post(receive_notification))
        .route("/api/calendar/webhook/renew", post(renew_webhooks))
        .with_state(Arc::new(state))
}

/// POST /api/calendar/webhook
///
/// Always 200: Google retries non-2xx deliveries with backoff and stops the
/// channel if they persist.
async fn receive_notification(
    State(state): State<Arc<WebhookAppState>>,
    headers: HeaderMap,
) -> StatusCode {
    let notification = match Notification::from_headers(&headers) {
        Ok(notification) => notification,
        Err(e) => {
            warn!(error = %e, "Malformed webhook notification");
            return StatusCode::OK;
        }
    };

    match state.orchestrator.handle(&notification) {
        Ok(NotificationOutcome::Handshake) => {
            info!(channel_id = %notification.channel_id, "Webhook channel handshake acknowledged");
        }
        Ok(NotificationOutcome::Queued { user_id }) | Ok(NotificationOutcome::Backlogged { user_id }) => {
            debug!(
                user_id = %user_id,
                channel_id = %notification.channel_id,
                state = ?notification.resource_state,
                "Webhook notification accepted"
            );
        }
        Err(SyncError::Attribution(reason)) => {
            warn!(
                channel_id = %notification.channel_id,
                reason = %reason,
                "Dropping unattributable webhook notification"
            );
        }
        Err(e) => {
            warn!(channel_id = %notification.channel_id, error = %e, "Webhook notification not processed");
        }
    }

    StatusCode::OK
}

/// POST /api/calendar/webhook/renew
///
/// Body `{"user_id": "..."}` renews one user; an empty body renews everyone.
/// Anything else is rejected rather than widened to everyone.
async fn renew_webhooks(
    State(state): State<Arc<WebhookAppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RenewResponse>, AppError> {
    authorize_trigger(
        &headers,
        state.admin_token.as_deref(),
        state.users.as_ref(),
        &state.renewal_callers,
    )
    .await?;
    let request = parse_renew_request(&body)?;

    let webhooks = state
        .webhooks
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("calendar integration is not configured".to_string()))?;

    let renewals = match request.user_id {
        Some(user_id) => {
            let result = webhooks.check_and_renew(&user_id).await;
            vec![UserRenewal { user_id, result }]
        }
        None => webhooks
            .renew_all()
            .await
            .map_err(|e| AppError::ServerError(e.to_string()))?,
    };

    let response = RenewResponse::from_reports(renewals.into_iter().map(RenewalReport::from).collect());
    info!(
        renewed = response.renewed,
        still_valid = response.still_valid,
        failed = response.failed,
        "Webhook renewal pass complete"
    );
    Ok(Json(response))
}

fn parse_renew_request(body: &[u8]) -> Result<RenewRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RenewRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid renew request: {}", e)))
}
