//! Browser-facing OAuth endpoints.
//!
//! `start` is called by the signed-in CRM user and redirects to Google.
//! `callback` is Google's redirect back; it has no session of its own, so the
//! user is recovered from the issued `state`. Every callback outcome is a
//! redirect to the CRM's integrations page with a `connected` or `error` flag.

use crate::auth::{authenticate, AuthError, UserResolver};
use crate::credentials::{CredentialStore, ServiceId};
use crate::oauth::{ProviderRegistry, StateManager, TokenEndpoint};
use crate::webhook::WebhookManager;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
    NotFound(String),
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
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

/// Shared application state for OAuth endpoints
#[derive(Clone)]
pub struct OAuthAppState {
    pub credential_store: Arc<CredentialStore>,
    pub providers: ProviderRegistry,
    pub state_manager: StateManager,
    pub users: Arc<dyn UserResolver>,
    /// Calendar webhook lifecycle; `None` when calendar is not configured
    pub webhooks: Option<Arc<WebhookManager>>,
    /// CRM frontend base URL
    pub app_url: String,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/integrations/:service/oauth/start", get(oauth_start))
        .route("/api/integrations/:service/oauth/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

fn parse_service(raw: &str) -> Result<ServiceId, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("Unknown integration '{}'", raw)))
}

/// GET /api/integrations/:service/oauth/start
async fn oauth_start(
    State(state): State<Arc<OAuthAppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let service = parse_service(&service)?;
    let user_id = authenticate(&headers, state.users.as_ref()).await?;

    let client = state.providers.get(service).ok_or_else(|| {
        error!(service = %service, "OAuth start for unconfigured service");
        AppError::ServiceUnavailable(format!("{} integration is not configured", service))
    })?;

    let oauth_state = state.state_manager.issue(service, &user_id);
    let auth_url = client.config().authorization_url(&oauth_state);

    info!(service = %service, user_id = %user_id, "Redirecting to OAuth provider");
    Ok(Redirect::temporary(&auth_url))
}

/// GET /api/integrations/:service/oauth/callback
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Path(service): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Redirect, AppError> {
    let service = parse_service(&service)?;
    let back = |flag: &str, value: &str| {
        Redirect::to(&format!(
            "{}/integrations?{}={}",
            state.app_url.trim_end_matches('/'),
            flag,
            urlencoding::encode(value)
        ))
    };

    if let Some(error) = callback.error {
        warn!(service = %service, error = %error, "OAuth authorization denied or failed");
        return Ok(back("error", &error));
    }

    let (Some(code), Some(oauth_state)) = (callback.code, callback.state) else {
        warn!(service = %service, "OAuth callback missing code or state");
        return Ok(back("error", "invalid_params"));
    };

    let pending = match state.state_manager.redeem(&oauth_state) {
        Some(pending) if pending.service == service => pending,
        Some(pending) => {
            warn!(expected = %pending.service, actual = %service, "OAuth state issued for another service");
            return Ok(back("error", "invalid_state"));
        }
        None => {
            warn!(service = %service, "Unknown or expired OAuth state");
            return Ok(back("error", "invalid_state"));
        }
    };
    let user_id = pending.user_id;

    let Some(client) = state.providers.get(service) else {
        error!(service = %service, "OAuth callback for unconfigured service");
        return Ok(back("error", "not_configured"));
    };

    debug!(service = %service, user_id = %user_id, "Exchanging authorization code");
    let grant = match client.exchange_code_for_tokens(&code).await {
        Ok(grant) => grant,
        Err(e) => {
            error!(service = %service, user_id = %user_id, error = %e, "Token exchange failed");
            return Ok(back("error", "token_exchange_failed"));
        }
    };

    let has_refresh_token = grant.refresh_token.is_some();
    if let Err(e) = state
        .credential_store
        .upsert(&user_id, service, &grant.into_credentials(None))
    {
        error!(service = %service, user_id = %user_id, error = %e, "Failed to store credentials");
        return Ok(back("error", "storage_failed"));
    }

    info!(
        service = %service,
        user_id = %user_id,
        has_refresh_token,
        "OAuth flow completed"
    );

    if service.supports_webhooks() {
        match &state.webhooks {
            Some(webhooks) => {
                // Sync still works without push; the renewal pass retries
                if let Err(e) = webhooks.register(&user_id).await {
                    warn!(user_id = %user_id, error = %e, "Webhook registration after connect failed");
                }
            }
            None => warn!(service = %service, "No webhook manager, push sync disabled"),
        }
    }

    Ok(back("connected", service.as_str()))
}
