use crate::auth::{authenticate, AuthError, UserResolver};
use crate::credentials::{CredentialStore, ServiceId};
use crate::error::SyncError;
use crate::oauth::ProviderRegistry;
use crate::webhook::WebhookManager;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
    NotFound(String),
    ServiceUnavailable(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
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

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        error!(error = %e, "Integration request failed");
        AppError::ServerError(e.to_string())
    }
}

/// Shared application state for integration management endpoints
#[derive(Clone)]
pub struct IntegrationsAppState {
    pub credential_store: Arc<CredentialStore>,
    pub providers: ProviderRegistry,
    pub users: Arc<dyn UserResolver>,
    pub webhooks: Option<Arc<WebhookManager>>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct IntegrationStatus {
    pub is_connected: bool,
    pub token_expiry: Option<DateTime<Utc>>,
    pub webhook_expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct IntegrationSummary {
    service: ServiceId,
    configured: bool,
    is_connected: bool,
}

#[derive(Serialize)]
struct ListResponse {
    integrations: Vec<IntegrationSummary>,
}

#[derive(Serialize)]
struct DisconnectResponse {
    success: bool,
}

pub fn create_integrations_router(state: IntegrationsAppState) -> Router {
    Router::new()
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/:service/status", get(integration_status))
        .route("/api/integrations/:service/disconnect", post(disconnect_integration))
        .with_state(Arc::new(state))
}

fn parse_service(raw: &str) -> Result<ServiceId, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("Unknown integration '{}'", raw)))
}

/// GET /api/integrations
async fn list_integrations(
    State(state): State<Arc<IntegrationsAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListResponse>, AppError> {
    let user_id = authenticate(&headers, state.users.as_ref()).await?;
    let connected = state
        .credential_store
        .list_by_user(&user_id)
        .map_err(SyncError::from)?;

    let integrations = ServiceId::ALL
        .into_iter()
        .map(|service| IntegrationSummary {
            service,
            configured: state.providers.is_configured(service),
            is_connected: connected.contains(&service),
        })
        .collect();

    Ok(Json(ListResponse { integrations }))
}

/// GET /api/integrations/:service/status
async fn integration_status(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<IntegrationStatus>, AppError> {
    let service = parse_service(&service)?;
    let user_id = authenticate(&headers, state.users.as_ref()).await?;

    let status = match state
        .credential_store
        .get_active(&user_id, service)
        .map_err(SyncError::from)?
    {
        Some(record) => IntegrationStatus {
            is_connected: true,
            token_expiry: Some(record.credentials.expires_at),
            webhook_expires_at: record.webhook_expires_at,
        },
        None => IntegrationStatus {
            is_connected: false,
            token_expiry: None,
            webhook_expires_at: None,
        },
    };

    Ok(Json(status))
}

/// POST /api/integrations/:service/disconnect
///
/// Idempotent: disconnecting a service that was never connected succeeds.
async fn disconnect_integration(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let service = parse_service(&service)?;
    let user_id = authenticate(&headers, state.users.as_ref()).await?;

    match &state.webhooks {
        Some(webhooks) if webhooks.service() == service => webhooks.disconnect(&user_id).await?,
        _ => {
            state
                .credential_store
                .deactivate(&user_id, service)
                .map_err(SyncError::from)?;
            info!(user_id = %user_id, service = %service, "Integration disconnected");
        }
    }

    Ok(Json(DisconnectResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_status_serialization() {
        let json = serde_json::to_value(IntegrationStatus {
            is_connected: false,
            token_expiry: None,
            webhook_expires_at: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"is_connected": false, "token_expiry": null, "webhook_expires_at": null})
        );
    }
}
