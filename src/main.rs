use anyhow::{Context, Result};
use axum::http::HeaderValue;
use crm_sync::api::{
    create_integrations_router, create_oauth_router, create_webhook_router, IntegrationsAppState,
    OAuthAppState, WebhookAppState,
};
use crm_sync::auth::{IdentityUserResolver, StaticUserResolver, UserResolver};
use crm_sync::config::{AppConfig, Secrets};
use crm_sync::credentials::{CredentialStore, ServiceId};
use crm_sync::oauth::{run_state_cleanup, ProviderRegistry, StateManager, TokenEndpoint};
use crm_sync::sync::{
    run_reconcile_worker, CalendarReconciler, EventSink, GoogleEventsClient, HttpEventSink,
    SyncOrchestrator, TracingEventSink,
};
use crm_sync::webhook::{GoogleCalendarChannels, KeyedLocks, WebhookManager};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crm_sync=info".into()),
        )
        .init();

    info!("crm-sync starting...");

    let config_path = std::env::var("CRM_SYNC_CONFIG").ok();
    let config = AppConfig::load(config_path.as_deref())?;
    let secrets = Secrets::from_env();

    let encryption_key = secrets
        .encryption_key
        .clone()
        .context("CRM_SYNC_ENCRYPTION_KEY must be set (base64-encoded 32-byte key)")?;
    let credential_store = Arc::new(
        CredentialStore::new(&config.server.database_path, &encryption_key)
            .context("Failed to open credential store")?,
    );
    info!(path = %config.server.database_path, "Credential store ready");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.oauth.http_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let providers = ProviderRegistry::from_env(&config.server.public_url, http_client.clone())?;

    let users: Arc<dyn UserResolver> = match &config.session.identity_url {
        Some(url) => Arc::new(IdentityUserResolver::new(
            http_client.clone(),
            url.clone(),
            secrets.identity_api_key.clone(),
        )),
        None => {
            warn!("No identity provider configured, user endpoints will reject every token");
            Arc::new(StaticUserResolver::new())
        }
    };

    let calendar_tokens: Option<Arc<dyn TokenEndpoint>> = providers
        .get(ServiceId::GoogleCalendar)
        .map(|client| client as Arc<dyn TokenEndpoint>);

    let webhooks = calendar_tokens.clone().map(|tokens| {
        Arc::new(WebhookManager::new(
            credential_store.clone(),
            tokens,
            Arc::new(GoogleCalendarChannels::new(http_client.clone())),
            KeyedLocks::new(),
            config.webhook_settings(),
        ))
    });
    info!(callback_url = %config.webhook_callback_url(), enabled = webhooks.is_some(), "Webhook manager configured");

    // Reconciliation queue
    let (job_tx, job_rx) = tokio::sync::mpsc::channel(config.sync.queue_capacity);
    let orchestrator = Arc::new(SyncOrchestrator::new(credential_store.clone(), job_tx));

    match calendar_tokens {
        Some(tokens) => {
            let sink: Arc<dyn EventSink> = match &config.sync.event_sink_url {
                Some(url) => Arc::new(HttpEventSink::new(http_client.clone(), url.clone())),
                None => Arc::new(TracingEventSink),
            };
            let reconciler = Arc::new(CalendarReconciler::new(
                credential_store.clone(),
                tokens,
                GoogleEventsClient::new(http_client.clone()),
                sink,
                chrono::Duration::hours(config.sync.lookback_hours),
            ));
            tokio::spawn(run_reconcile_worker(job_rx, reconciler, orchestrator.backlog()));
        }
        None => {
            warn!("Calendar not configured, reconcile worker not started");
            drop(job_rx);
        }
    }

    let state_manager = StateManager::new(config.oauth.state_ttl_seconds);
    tokio::spawn(run_state_cleanup(
        state_manager.clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let oauth_router = create_oauth_router(OAuthAppState {
        credential_store: credential_store.clone(),
        providers: providers.clone(),
        state_manager,
        users: users.clone(),
        webhooks: webhooks.clone(),
        app_url: config.server.app_url.clone(),
    });
    let integrations_router = create_integrations_router(IntegrationsAppState {
        credential_store: credential_store.clone(),
        providers,
        users: users.clone(),
        webhooks: webhooks.clone(),
    });
    let webhook_router = create_webhook_router(WebhookAppState {
        orchestrator,
        webhooks,
        admin_token: secrets.admin_token.clone(),
        users,
        renewal_callers: config.webhook.renewal_callers.clone(),
    });
    if secrets.admin_token.is_none() && config.webhook.renewal_callers.is_empty() {
        warn!("CRM_SYNC_ADMIN_TOKEN not set, renewal trigger is unauthenticated");
    }

    let app = oauth_router
        .merge(integrations_router)
        .merge(webhook_router)
        .layer(cors_layer(&config.server.cors_origins));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("crm-sync stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
