// Integration tests for the OAuth start/callback endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use crm_sync::api::{create_oauth_router, OAuthAppState};
use crm_sync::auth::StaticUserResolver;
use crm_sync::credentials::{CredentialStore, ServiceId, WebhookState};
use crm_sync::oauth::{OAuthClient, OAuthProviderConfig, ProviderRegistry, StateManager};
use crm_sync::webhook::{GoogleCalendarChannels, KeyedLocks, WebhookManager, WebhookSettings};
use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use tower::ServiceExt;

const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
const APP_URL: &str = "https://crm.example.com";

struct TestApp {
    router: Router,
    store: Arc<CredentialStore>,
}

fn provider_config(server: &ServerGuard) -> OAuthProviderConfig {
    let mut config = OAuthProviderConfig::for_service(
        ServiceId::GoogleCalendar,
        "client-123".to_string(),
        "secret-456".to_string(),
        "https://api.crm.example.com",
    )
    .unwrap();
    config.token_url = format!("{}/token", server.url());
    config
}

/// Calendar configured against `server`; the `alice-token` bearer is user `alice`.
fn create_test_app(server: &ServerGuard, with_webhooks: bool) -> TestApp {
    let store = Arc::new(CredentialStore::new(":memory:", KEY).unwrap());
    let http = reqwest::Client::new();
    let client = Arc::new(OAuthClient::new(provider_config(server), http.clone()));

    let mut providers = ProviderRegistry::new();
    providers.insert(OAuthClient::new(provider_config(server), http.clone()));

    let users = StaticUserResolver::new();
    users.insert("alice-token", "alice");

    let webhooks = with_webhooks.then(|| {
        Arc::new(WebhookManager::new(
            store.clone(),
            client,
            Arc::new(GoogleCalendarChannels::with_base_url(
                http.clone(),
                server.url(),
                "primary".to_string(),
            )),
            KeyedLocks::new(),
            WebhookSettings::new("https://api.crm.example.com/api/calendar/webhook"),
        ))
    });

    let router = create_oauth_router(OAuthAppState {
        credential_store: store.clone(),
        providers,
        state_manager: StateManager::new(600),
        users: Arc::new(users),
        webhooks,
        app_url: APP_URL.to_string(),
    });

    TestApp { router, store }
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect has a location")
        .to_str()
        .unwrap()
        .to_string()
}

/// Runs the start endpoint and returns the issued state.
async fn start_flow(app: &TestApp) -> String {
    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/google_calendar/oauth/start", Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let url = reqwest::Url::parse(&location(&response)).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .expect("authorization URL carries state")
}

/// Start redirects to Google with offline access and the minimal scope.
#[tokio::test]
async fn test_start_redirects_to_provider() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/google_calendar/oauth/start", Some("alice-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = location(&response);
    assert!(location.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
    assert!(location.contains("client_id=client-123"));
    assert!(location.contains("access_type=offline"));
    assert!(location.contains("prompt=consent"));
    assert!(location.contains("calendar.events"));
}

#[tokio::test]
async fn test_start_requires_user() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/google_calendar/oauth/start", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/google_calendar/oauth/start", Some("stranger")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Gmail has no client credentials in this app.
#[tokio::test]
async fn test_start_unconfigured_service() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/gmail/oauth/start", Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_start_unknown_service() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/dropbox/oauth/start", Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_callback_missing_params() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/integrations/google_calendar/oauth/callback?code=abc", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), format!("{}/integrations?error=invalid_params", APP_URL));
}

#[tokio::test]
async fn test_callback_unknown_state() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/api/integrations/google_calendar/oauth/callback?code=abc&state=forged",
            None,
        ))
        .await
        .unwrap();

    assert_eq!(location(&response), format!("{}/integrations?error=invalid_state", APP_URL));
}

/// The provider's own error value is passed through.
#[tokio::test]
async fn test_callback_provider_error() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/api/integrations/google_calendar/oauth/callback?error=access_denied&state=x",
            None,
        ))
        .await
        .unwrap();

    assert_eq!(location(&response), format!("{}/integrations?error=access_denied", APP_URL));
}

#[tokio::test]
async fn test_callback_exchange_rejected() {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant","error_description":"Bad Request"}"#)
        .create_async()
        .await;
    let app = create_test_app(&server, false);

    let state = start_flow(&app).await;
    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/integrations/google_calendar/oauth/callback?code=used&state={}", state),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(
        location(&response),
        format!("{}/integrations?error=token_exchange_failed", APP_URL)
    );
    assert!(app.store.get("alice", ServiceId::GoogleCalendar).unwrap().is_none());
}

/// A successful callback stores the tokens and opens a push channel.
#[tokio::test]
async fn test_callback_connects_and_registers_webhook() {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "4/granted".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.first","refresh_token":"1//refresh","expires_in":3599}"#)
        .create_async()
        .await;
    let watch = server
        .mock("POST", "/calendar/v3/calendars/primary/events/watch")
        .match_header("authorization", "Bearer ya29.first")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "type": "web_hook",
            "token": "alice",
        })))
        .with_status(200)
        .with_body(r#"{"kind":"api#channel","id":"ignored","resourceId":"res-1"}"#)
        .create_async()
        .await;
    let app = create_test_app(&server, true);

    let state = start_flow(&app).await;
    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/integrations/google_calendar/oauth/callback?code=4%2Fgranted&state={}", state),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        format!("{}/integrations?connected=google_calendar", APP_URL)
    );
    token.assert_async().await;
    watch.assert_async().await;

    let record = app
        .store
        .get_active("alice", ServiceId::GoogleCalendar)
        .unwrap()
        .expect("record stored");
    assert_eq!(record.credentials.access_token, "ya29.first");
    assert_eq!(record.credentials.refresh_token.as_deref(), Some("1//refresh"));
    match record.webhook_state() {
        WebhookState::Active(channel) => assert_eq!(channel.resource_id, "res-1"),
        other => panic!("expected active channel, got {:?}", other),
    }

    // state is single-use
    let replay = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/integrations/google_calendar/oauth/callback?code=4%2Fgranted&state={}", state),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(location(&replay), format!("{}/integrations?error=invalid_state", APP_URL));
}

/// Webhook registration failure does not fail the connection.
#[tokio::test]
async fn test_callback_connects_when_watch_fails() {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"access_token":"ya29.first","refresh_token":"1//refresh","expires_in":3599}"#)
        .create_async()
        .await;
    let _watch = server
        .mock("POST", "/calendar/v3/calendars/primary/events/watch")
        .with_status(403)
        .with_body(r#"{"error":{"message":"push not allowed"}}"#)
        .create_async()
        .await;
    let app = create_test_app(&server, true);

    let state = start_flow(&app).await;
    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/integrations/google_calendar/oauth/callback?code=c&state={}", state),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(
        location(&response),
        format!("{}/integrations?connected=google_calendar", APP_URL)
    );
    let record = app.store.get_active("alice", ServiceId::GoogleCalendar).unwrap().unwrap();
    assert_eq!(record.webhook_state(), WebhookState::Unregistered);
}

/// A state issued for calendar cannot complete a gmail callback.
#[tokio::test]
async fn test_callback_service_mismatch() {
    let server = Server::new_async().await;
    let app = create_test_app(&server, false);

    let state = start_flow(&app).await;
    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/integrations/gmail/oauth/callback?code=c&state={}", state),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(location(&response), format!("{}/integrations?error=invalid_state", APP_URL));
}

/// A code redeemed twice is rejected by the provider the second time and the
/// first connection's tokens stay in place.
#[tokio::test]
async fn test_second_redemption_keeps_first_credentials() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("code".into(), "4/once".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.first","refresh_token":"1//refresh","expires_in":3599}"#)
        .expect(1)
        .create_async()
        .await;
    let app = create_test_app(&server, false);
    let callback = |state: &str| {
        get(
            &format!("/api/integrations/google_calendar/oauth/callback?code=4%2Fonce&state={}", state),
            None,
        )
    };

    let state = start_flow(&app).await;
    let response = app.router.clone().oneshot(callback(&state)).await.unwrap();
    assert_eq!(
        location(&response),
        format!("{}/integrations?connected=google_calendar", APP_URL)
    );
    first.assert_async().await;
    first.remove_async().await;

    let replayed = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("code".into(), "4/once".into()))
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant","error_description":"Bad Request"}"#)
        .expect(1)
        .create_async()
        .await;

    let state = start_flow(&app).await;
    let response = app.router.clone().oneshot(callback(&state)).await.unwrap();
    assert_eq!(
        location(&response),
        format!("{}/integrations?error=token_exchange_failed", APP_URL)
    );
    replayed.assert_async().await;

    let record = app
        .store
        .get_active("alice", ServiceId::GoogleCalendar)
        .unwrap()
        .expect("first connection kept");
    assert_eq!(record.credentials.access_token, "ya29.first");
    assert_eq!(record.credentials.refresh_token.as_deref(), Some("1//refresh"));
}
