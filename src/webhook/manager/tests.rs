use super::*;
use crate::credentials::Credentials;
use crate::oauth::testing::FakeTokenEndpoint;
use crate::webhook::provider::ChannelGrant;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::DateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const CALLBACK: &str = "https://crm.example.com/api/calendar/webhook";

#[derive(Default)]
struct FakeChannels {
    watched: Mutex<Vec<(String, WatchRequest)>>,
    stopped: Mutex<Vec<String>>,
    granted_ttl: Mutex<Option<Duration>>,
    fail_watch: AtomicBool,
    fail_stop: AtomicBool,
}

impl FakeChannels {
    fn with_ttl(ttl: Option<Duration>) -> Self {
        let fake = Self::default();
        *fake.granted_ttl.lock().unwrap() = ttl;
        fake
    }

    fn watch_count(&self) -> usize {
        self.watched.lock().unwrap().len()
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushChannelProvider for FakeChannels {
    async fn watch(&self, access_token: &str, request: &WatchRequest) -> Result<ChannelGrant, SyncError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(SyncError::WebhookRegistration("watch rejected with status 403".into()));
        }
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;
        self.watched
            .lock()
            .unwrap()
            .push((access_token.to_string(), request.clone()));
        let ttl = *self.granted_ttl.lock().unwrap();
        Ok(ChannelGrant {
            resource_id: format!("res-{}", request.channel_id),
            expires_at: ttl.map(|ttl| Utc::now() + ttl),
        })
    }

    async fn stop(&self, _access_token: &str, channel_id: &str, _resource_id: &str) -> Result<(), SyncError> {
        self.stopped.lock().unwrap().push(channel_id.to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(SyncError::WebhookRegistration("channel stop rejected with status 404".into()));
        }
        Ok(())
    }
}

struct Harness {
    store: Arc<CredentialStore>,
    tokens: Arc<FakeTokenEndpoint>,
    channels: Arc<FakeChannels>,
    manager: Arc<WebhookManager>,
}

fn harness(channels: FakeChannels) -> Harness {
    let store = Arc::new(CredentialStore::new(":memory:", &BASE64.encode([3u8; 32])).unwrap());
    let tokens = Arc::new(FakeTokenEndpoint::new(ServiceId::GoogleCalendar));
    let channels = Arc::new(channels);
    let manager = Arc::new(WebhookManager::new(
        store.clone(),
        tokens.clone(),
        channels.clone(),
        KeyedLocks::new(),
        WebhookSettings::new(CALLBACK),
    ));
    Harness {
        store,
        tokens,
        channels,
        manager,
    }
}

fn connect(store: &CredentialStore, user_id: &str, expires_in: Duration) {
    store
        .upsert(
            user_id,
            ServiceId::GoogleCalendar,
            &Credentials {
                access_token: format!("ya29.{}", user_id),
                refresh_token: Some(format!("1//{}", user_id)),
                expires_at: Utc::now() + expires_in,
            },
        )
        .unwrap();
}

fn seed_channel(store: &CredentialStore, user_id: &str, channel_id: &str, expires_at: DateTime<Utc>) {
    store
        .set_webhook(
            user_id,
            ServiceId::GoogleCalendar,
            &WebhookChannel {
                channel_id: channel_id.to_string(),
                resource_id: format!("res-{}", channel_id),
                expires_at,
            },
        )
        .unwrap();
}

fn stored_state(store: &CredentialStore, user_id: &str) -> WebhookState {
    store
        .get(user_id, ServiceId::GoogleCalendar)
        .unwrap()
        .unwrap()
        .webhook_state()
}

#[tokio::test]
async fn test_register_persists_channel() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));

    let channel = h.manager.register("u1").await.unwrap();

    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(channel.clone()));
    let watched = h.channels.watched.lock().unwrap();
    let (access_token, request) = &watched[0];
    assert_eq!(access_token, "ya29.u1");
    assert_eq!(request.channel_id, channel.channel_id);
    assert_eq!(request.channel_token, "u1");
    assert_eq!(request.callback_url, CALLBACK);
    assert_eq!(request.ttl_seconds, 7 * 24 * 3600);
}

#[tokio::test]
async fn test_register_caps_expiry_at_seven_days() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(30))));
    connect(&h.store, "u1", Duration::hours(1));

    let channel = h.manager.register("u1").await.unwrap();
    assert!(channel.expires_at <= Utc::now() + Duration::days(7));
    assert!(channel.expires_at > Utc::now() + Duration::days(6));
}

#[tokio::test]
async fn test_register_without_granted_expiry_uses_cap() {
    let h = harness(FakeChannels::with_ttl(None));
    connect(&h.store, "u1", Duration::hours(1));

    let channel = h.manager.register("u1").await.unwrap();
    assert!(channel.expires_at > Utc::now() + Duration::days(6));
}

#[tokio::test]
async fn test_register_refreshes_expired_token_first() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", -Duration::minutes(10));

    h.manager.register("u1").await.unwrap();

    assert_eq!(h.tokens.refresh_calls(), 1);
    assert_eq!(h.channels.watched.lock().unwrap()[0].0, "ya29.refreshed-1");
}

#[tokio::test]
async fn test_register_twice_replaces_and_stops_previous() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));

    let first = h.manager.register("u1").await.unwrap();
    let second = h.manager.register("u1").await.unwrap();

    assert_ne!(first.channel_id, second.channel_id);
    assert_eq!(h.channels.stopped(), vec![first.channel_id]);
    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(second));
}

#[tokio::test]
async fn test_concurrent_registers_keep_one_channel() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));

    let (a, b) = tokio::join!(h.manager.register("u1"), h.manager.register("u1"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.channel_id, b.channel_id);
    assert_eq!(h.channels.watch_count(), 2);

    // Whichever ran second stopped the first and owns the record
    let WebhookState::Active(kept) = stored_state(&h.store, "u1") else {
        panic!("expected an active channel");
    };
    let stopped = h.channels.stopped();
    assert_eq!(stopped.len(), 1);
    assert_ne!(stopped[0], kept.channel_id);
    assert!(kept == a || kept == b);
}

#[tokio::test]
async fn test_stop_failure_is_not_fatal() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    seed_channel(&h.store, "u1", "old", Utc::now() + Duration::hours(1));
    h.channels.fail_stop.store(true, Ordering::SeqCst);

    let channel = h.manager.register("u1").await.unwrap();
    assert_eq!(h.channels.stopped(), vec!["old".to_string()]);
    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(channel));
}

#[tokio::test]
async fn test_watch_failure_keeps_previous_channel_live() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    seed_channel(&h.store, "u1", "old", Utc::now() + Duration::hours(1));
    h.channels.fail_watch.store(true, Ordering::SeqCst);

    let err = h.manager.register("u1").await.unwrap_err();
    assert!(matches!(err, SyncError::WebhookRegistration(_)));

    // The stored channel was never stopped, so it is still delivering
    assert!(h.channels.stopped().is_empty());
    let WebhookState::Active(channel) = stored_state(&h.store, "u1") else {
        panic!("expected the previous channel to remain");
    };
    assert_eq!(channel.channel_id, "old");

    h.channels.fail_watch.store(false, Ordering::SeqCst);
    let RenewalOutcome::Renewed(renewed) = h.manager.check_and_renew("u1").await.unwrap() else {
        panic!("expected the next pass to renew");
    };
    assert_eq!(h.channels.stopped(), vec!["old".to_string()]);
    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(renewed));
}

#[tokio::test]
async fn test_previous_channel_stopped_after_new_one_stored() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    seed_channel(&h.store, "u1", "old", Utc::now() + Duration::hours(6 * 24));

    let channel = h.manager.register("u1").await.unwrap();

    assert_eq!(h.channels.watch_count(), 1);
    assert_eq!(h.channels.stopped(), vec!["old".to_string()]);
    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(channel));
}

#[tokio::test]
async fn test_register_revoked_token_requires_reconnect() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", -Duration::minutes(10));
    h.tokens.revoke("1//u1");

    let err = h.manager.register("u1").await.unwrap_err();
    assert!(err.requires_reconnect());
    assert_eq!(h.channels.watch_count(), 0);
}

#[tokio::test]
async fn test_check_and_renew_still_valid() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    seed_channel(&h.store, "u1", "live", Utc::now() + Duration::hours(48));

    let outcome = h.manager.check_and_renew("u1").await.unwrap();

    assert_eq!(outcome, RenewalOutcome::StillValid { hours_remaining: 47 });
    assert_eq!(h.channels.watch_count(), 0);
    assert!(h.channels.stopped().is_empty());
}

#[tokio::test]
async fn test_check_and_renew_replaces_expiring_channel() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    let old_expiry = Utc::now() + Duration::hours(2);
    seed_channel(&h.store, "u1", "expiring", old_expiry);

    let RenewalOutcome::Renewed(channel) = h.manager.check_and_renew("u1").await.unwrap() else {
        panic!("expected renewal");
    };

    assert!(channel.expires_at > old_expiry);
    assert_ne!(channel.channel_id, "expiring");
    assert_eq!(h.channels.stopped(), vec!["expiring".to_string()]);
    assert_eq!(stored_state(&h.store, "u1"), WebhookState::Active(channel));
}

#[tokio::test]
async fn test_check_and_renew_registers_when_unregistered() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));

    let outcome = h.manager.check_and_renew("u1").await.unwrap();
    assert!(matches!(outcome, RenewalOutcome::Renewed(_)));
    assert!(h.channels.stopped().is_empty());
}

#[tokio::test]
async fn test_check_and_renew_not_connected() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));

    let err = h.manager.check_and_renew("nobody").await.unwrap_err();
    assert!(matches!(err, SyncError::NotConnected { .. }));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    let channel = h.manager.register("u1").await.unwrap();

    h.manager.disconnect("u1").await.unwrap();
    h.manager.disconnect("u1").await.unwrap();

    let record = h.store.get("u1", ServiceId::GoogleCalendar).unwrap().unwrap();
    assert!(!record.is_active);
    assert_eq!(record.webhook_state(), WebhookState::Unregistered);
    assert_eq!(h.channels.stopped(), vec![channel.channel_id]);
}

#[tokio::test]
async fn test_disconnect_unknown_user_succeeds() {
    let h = harness(FakeChannels::default());
    h.manager.disconnect("ghost").await.unwrap();
}

#[tokio::test]
async fn test_disconnect_survives_stop_failure() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "u1", Duration::hours(1));
    h.manager.register("u1").await.unwrap();
    h.channels.fail_stop.store(true, Ordering::SeqCst);

    h.manager.disconnect("u1").await.unwrap();
    assert!(h.store.get_active("u1", ServiceId::GoogleCalendar).unwrap().is_none());
}

#[tokio::test]
async fn test_renew_all_reports_each_active_user() {
    let h = harness(FakeChannels::with_ttl(Some(Duration::days(7))));
    connect(&h.store, "fresh", Duration::hours(1));
    seed_channel(&h.store, "fresh", "c-fresh", Utc::now() + Duration::days(5));
    connect(&h.store, "stale", Duration::hours(1));
    seed_channel(&h.store, "stale", "c-stale", Utc::now() + Duration::hours(3));
    connect(&h.store, "revoked", -Duration::hours(1));
    h.tokens.revoke("1//revoked");
    connect(&h.store, "gone", Duration::hours(1));
    h.store.deactivate("gone", ServiceId::GoogleCalendar).unwrap();

    let mut results = h.manager.renew_all().await.unwrap();
    results.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    let users: Vec<_> = results.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(users, vec!["fresh", "revoked", "stale"]);
    assert!(matches!(results[0].result, Ok(RenewalOutcome::StillValid { .. })));
    assert!(matches!(results[1].result, Err(SyncError::Refresh(_))));
    assert!(matches!(results[2].result, Ok(RenewalOutcome::Renewed(_))));
}

#[test]
fn test_renewal_outcome_serialization() {
    let json = serde_json::to_value(RenewalOutcome::StillValid { hours_remaining: 30 }).unwrap();
    assert_eq!(json["outcome"], "still_valid");
    assert_eq!(json["hours_remaining"], 30);
}
