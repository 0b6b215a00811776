use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Externally reachable base URL of this service (OAuth and webhook callbacks)
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// CRM frontend the OAuth callback redirects back to
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Empty means any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_app_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_database_path() -> String {
    "crm-sync.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_url: default_public_url(),
            app_url: default_app_url(),
            database_path: default_database_path(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    /// Applies to every outbound provider call
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Defaults to `{public_url}/api/calendar/webhook`
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_renewal_threshold")]
    pub renewal_threshold_hours: i64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_days: i64,
    /// Identity-provider users allowed to call the renewal trigger, in
    /// addition to the admin token
    #[serde(default)]
    pub renewal_callers: Vec<String>,
}

fn default_renewal_threshold() -> i64 {
    24
}

fn default_max_ttl() -> i64 {
    7
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            callback_url: None,
            renewal_threshold_hours: default_renewal_threshold(),
            max_ttl_days: default_max_ttl(),
            renewal_callers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Identity provider auth API, e.g. `https://<project>.supabase.co/auth/v1`
    #[serde(default)]
    pub identity_url: Option<String>,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_seconds: i64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
}

fn default_refresh_threshold() -> i64 {
    300
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    2000
}

fn default_wait_timeout() -> u64 {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_url: None,
            refresh_threshold_seconds: default_refresh_threshold(),
            monitor_interval_seconds: default_monitor_interval(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            wait_timeout_ms: default_wait_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> crate::session::SessionSettings {
        crate::session::SessionSettings {
            refresh_threshold: chrono::Duration::seconds(self.refresh_threshold_seconds),
            max_attempts: self.max_attempts,
            retry_backoff: std::time::Duration::from_millis(self.retry_backoff_ms),
            wait_timeout: std::time::Duration::from_millis(self.wait_timeout_ms),
        }
    }

    pub fn monitor_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.monitor_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Window listed on a user's first reconciliation
    #[serde(default = "default_lookback")]
    pub lookback_hours: i64,
    /// CRM events API; changes are only logged when unset
    #[serde(default)]
    pub event_sink_url: Option<String>,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_lookback() -> i64 {
    24
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            lookback_hours: default_lookback(),
            event_sink_url: None,
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then apply `CRM_SYNC_*` overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CRM_SYNC_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("CRM_SYNC_PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Some(v) = lookup("CRM_SYNC_APP_URL") {
            self.server.app_url = v;
        }
        if let Some(v) = lookup("CRM_SYNC_DATABASE_PATH") {
            self.server.database_path = v;
        }
        if let Some(v) = lookup("CRM_SYNC_WEBHOOK_CALLBACK_URL") {
            self.webhook.callback_url = Some(v);
        }
        if let Some(v) = lookup("CRM_SYNC_IDENTITY_URL") {
            self.session.identity_url = Some(v);
        }
        if let Some(v) = lookup("CRM_SYNC_EVENT_SINK_URL") {
            self.sync.event_sink_url = Some(v);
        }
        if let Some(n) = lookup("CRM_SYNC_RENEWAL_THRESHOLD_HOURS").and_then(|v| v.parse().ok()) {
            self.webhook.renewal_threshold_hours = n;
        }
        if let Some(v) = lookup("CRM_SYNC_RENEWAL_CALLERS") {
            self.webhook.renewal_callers = v
                .split(',')
                .map(str::trim)
                .filter(|user| !user.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn webhook_callback_url(&self) -> String {
        self.webhook.callback_url.clone().unwrap_or_else(|| {
            format!(
                "{}/api/calendar/webhook",
                self.server.public_url.trim_end_matches('/')
            )
        })
    }

    pub fn webhook_settings(&self) -> crate::webhook::WebhookSettings {
        crate::webhook::WebhookSettings {
            callback_url: self.webhook_callback_url(),
            renewal_threshold: chrono::Duration::hours(self.webhook.renewal_threshold_hours),
            max_ttl: chrono::Duration::days(self.webhook.max_ttl_days),
        }
    }
}

/// Secrets, read only from the environment.
#[derive(Clone, Default)]
pub struct Secrets {
    pub encryption_key: Option<String>,
    pub admin_token: Option<String>,
    pub identity_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            encryption_key: read("CRM_SYNC_ENCRYPTION_KEY"),
            admin_token: read("CRM_SYNC_ADMIN_TOKEN"),
            identity_api_key: read("CRM_SYNC_IDENTITY_API_KEY"),
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<set>"))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .field("identity_api_key", &self.identity_api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: AppConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
