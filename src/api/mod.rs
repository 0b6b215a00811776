// HTTP endpoints: OAuth redirects, integration management, webhook intake

pub mod integrations;
pub mod oauth;
pub mod webhook;

pub use integrations::{create_integrations_router, IntegrationStatus, IntegrationsAppState};
pub use oauth::{create_oauth_router, OAuthAppState};
pub use webhook::{create_webhook_router, RenewResponse, WebhookAppState};
