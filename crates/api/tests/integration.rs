//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server.
//! State is backed by the in-memory store, so no database is needed.
//!
//! ```bash
//! cargo test -p beacon-api --test integration
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, SecondsFormat, Utc};
use tower::ServiceExt;
use uuid::Uuid;

use beacon_api::routes::create_router;
use beacon_api::state::{AppState, Components};
use beacon_common::clock::SystemClock;
use beacon_common::types::Channel;
use beacon_engine::store::MemoryStore;
use beacon_notifier::breaker::{BreakerSettings, InMemoryBreaker};
use beacon_notifier::directory::StaticDirectory;
use beacon_notifier::dispatcher::DispatchSettings;
use beacon_notifier::provider::{
    DeliveryProvider, InAppProvider, OutboundMessage, ProviderRegistry, SendOutcome,
};

// ============================================================
// Helpers
// ============================================================

struct EchoEmail;

#[async_trait]
impl DeliveryProvider for EchoEmail {
    fn name(&self) -> &str {
        "resend"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        SendOutcome::Success {
            message_id: format!("email-{}", message.attempt_id),
            response: serde_json::json!({ "id": message.attempt_id }),
            confirmed: false,
        }
    }
}

struct TestApp {
    app: Router,
    tenant: Uuid,
    user: Uuid,
}

fn build_test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);
    let directory = Arc::new(StaticDirectory::new());
    let tenant = Uuid::new_v4();
    let user = Uuid::new_v4();
    directory.add(tenant, user, Channel::Email, "owner@example.com");

    let state = AppState::new(Components {
        notifications: store.clone(),
        attempts: store,
        providers: ProviderRegistry::new()
            .register(Arc::new(InAppProvider))
            .register(Arc::new(EchoEmail)),
        breaker: Arc::new(InMemoryBreaker::new(
            BreakerSettings::default(),
            clock.clone(),
        )),
        directory,
        clock,
        dispatch: DispatchSettings::default(),
    });

    TestApp {
        app: create_router(state),
        tenant,
        user,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn create_body(t: &TestApp, channels: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "tenant_id": t.tenant,
        "user_id": t.user,
        "module": "inventory",
        "event_type": "stock_low",
        "entity_type": "part",
        "entity_id": "BRK-204",
        "title": "Stock low",
        "message": "Brake pads BRK-204 below reorder point",
        "priority": "medium",
        "channels": channels,
        "metadata": { "on_hand": 2, "location": "Main" }
    })
}

async fn create(t: &TestApp, channels: &[&str]) -> serde_json::Value {
    let (status, json) = send(
        &t.app,
        post_json("/api/notifications", create_body(t, channels)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json
}

fn window(t: &TestApp) -> String {
    let start = (Utc::now() - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let end = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    format!("tenant_id={}&start={start}&end={end}", t.tenant)
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let t = build_test_app();
    let (status, json) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "beacon-api");
}

// ============================================================
// Notifications
// ============================================================

#[tokio::test]
async fn test_create_returns_per_channel_outcome() {
    let t = build_test_app();
    let json = create(&t, &["in_app", "email", "sms"]).await;

    assert_eq!(json["channels"]["in_app"], "sent");
    assert_eq!(json["channels"]["email"], "sent");
    // No SMS endpoint on file.
    assert_eq!(json["channels"]["sms"], "failed");
    assert_eq!(json["attempt_ids"].as_array().unwrap().len(), 3);

    let id = json["notification_id"].as_str().unwrap();
    let (status, detail) = send(&t.app, get(&format!("/api/notifications/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["notification"]["priority"], "normal");
    assert_eq!(detail["notification"]["thread_id"], "part:BRK-204");

    let attempts = detail["attempts"].as_array().unwrap();
    let sms = attempts.iter().find(|a| a["channel"] == "sms").unwrap();
    assert_eq!(sms["status"], "failed");
    assert!(sms["reason"].as_str().unwrap().contains("No active address"));
    let in_app = attempts.iter().find(|a| a["channel"] == "in_app").unwrap();
    assert_eq!(in_app["status"], "delivered");
    assert!(in_app["reason"].is_null());
}

#[tokio::test]
async fn test_invalid_create_is_rejected() {
    let t = build_test_app();
    let (status, json) = send(&t.app, post_json("/api/notifications", create_body(&t, &[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("channel"));

    let (status, _) = send(&t.app, get(&format!("/api/notifications/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_inbox_read_and_dismiss() {
    let t = build_test_app();
    let first = create(&t, &["in_app"]).await;
    let second = create(&t, &["in_app"]).await;
    let first_id = first["notification_id"].as_str().unwrap().to_string();
    let second_id = second["notification_id"].as_str().unwrap().to_string();

    let inbox_uri = format!("/api/notifications?tenant_id={}&user_id={}", t.tenant, t.user);
    let (status, inbox) = send(&t.app, get(&inbox_uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox["notifications"].as_array().unwrap().len(), 2);
    assert_eq!(inbox["unread_count"], 2);

    let (status, json) = send(
        &t.app,
        post_json(
            "/api/notifications/read",
            serde_json::json!({ "user_id": t.user, "ids": [first_id] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["affected"], 1);

    // Reading again changes nothing.
    let (_, json) = send(
        &t.app,
        post_json(
            "/api/notifications/read",
            serde_json::json!({ "user_id": t.user, "ids": [first_id] }),
        ),
    )
    .await;
    assert_eq!(json["affected"], 0);

    // Another user cannot act on these records.
    let (_, json) = send(
        &t.app,
        post_json(
            "/api/notifications/dismiss",
            serde_json::json!({ "user_id": Uuid::new_v4(), "ids": [second_id] }),
        ),
    )
    .await;
    assert_eq!(json["affected"], 0);

    let (_, detail) = send(&t.app, get(&format!("/api/notifications/{first_id}"))).await;
    assert_eq!(detail["notification"]["is_read"], true);
    assert_eq!(detail["attempts"][0]["status"], "opened");

    let (_, json) = send(
        &t.app,
        post_json(
            "/api/notifications/dismiss",
            serde_json::json!({ "user_id": t.user, "ids": [second_id] }),
        ),
    )
    .await;
    assert_eq!(json["affected"], 1);

    let (_, inbox) = send(&t.app, get(&format!("{inbox_uri}&unread_only=true"))).await;
    assert!(inbox["notifications"].as_array().unwrap().is_empty());
    assert_eq!(inbox["unread_count"], 0);
}

#[tokio::test]
async fn test_thread_lists_related_records() {
    let t = build_test_app();
    create(&t, &["in_app"]).await;
    create(&t, &["in_app"]).await;

    let (status, json) = send(
        &t.app,
        get(&format!(
            "/api/notifications/threads/part:BRK-204?tenant_id={}",
            t.tenant
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 2);
}

// ============================================================
// Provider callbacks
// ============================================================

#[tokio::test]
async fn test_webhook_acknowledges_unknown_message() {
    let t = build_test_app();
    let (status, json) = send(
        &t.app,
        post_json(
            "/api/webhooks/delivery",
            serde_json::json!({
                "provider": "resend",
                "provider_message_id": "nope",
                "event_type": "opened",
                "event_metadata": {}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accepted"], true);
}

#[tokio::test]
async fn test_webhook_drops_untracked_event_types() {
    let t = build_test_app();
    let created = create(&t, &["email"]).await;
    let attempt_id = created["attempt_ids"][0].as_str().unwrap();

    let (status, json) = send(
        &t.app,
        post_json(
            "/api/webhooks/delivery",
            serde_json::json!({
                "provider": "resend",
                "provider_message_id": format!("email-{attempt_id}"),
                "event_type": "complained",
                "event_metadata": {}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accepted"], true);

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/webhooks/delivery")
        .header("content-type", "application/json")
        .body(Body::from("{\"provider\": "))
        .unwrap();
    let (status, json) = send(&t.app, malformed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accepted"], true);

    // The attempt is untouched.
    let id = created["notification_id"].as_str().unwrap();
    let (_, detail) = send(&t.app, get(&format!("/api/notifications/{id}"))).await;
    assert_eq!(detail["attempts"][0]["status"], "sent");
}

#[tokio::test]
async fn test_webhook_advances_attempt() {
    let t = build_test_app();
    let created = create(&t, &["email"]).await;
    let attempt_id = created["attempt_ids"][0].as_str().unwrap();

    for event_type in ["delivered", "clicked"] {
        let (status, _) = send(
            &t.app,
            post_json(
                "/api/webhooks/delivery",
                serde_json::json!({
                    "provider": "resend",
                    "provider_message_id": format!("email-{attempt_id}"),
                    "event_type": event_type,
                    "event_metadata": { "url": "https://example.com/parts/BRK-204" },
                    "timestamp": Utc::now().to_rfc3339()
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let id = created["notification_id"].as_str().unwrap();
    let (_, detail) = send(&t.app, get(&format!("/api/notifications/{id}"))).await;
    assert_eq!(detail["attempts"][0]["status"], "clicked");
}

// ============================================================
// Analytics
// ============================================================

#[tokio::test]
async fn test_analytics_reports_delivery_and_funnel() {
    let t = build_test_app();
    create(&t, &["in_app", "email"]).await;

    let (status, json) = send(
        &t.app,
        get(&format!("/api/analytics/delivery?{}", window(&t))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["overall"]["sent"], 2);
    assert_eq!(json["overall"]["delivered"], 1);
    assert_eq!(json["by_channel"]["in_app"]["delivery_rate"], 1.0);

    let (status, json) = send(&t.app, get(&format!("/api/analytics/funnel?{}", window(&t)))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sent"], 2);
    assert_eq!(json["delivered"], 1);

    let (status, json) = send(
        &t.app,
        get(&format!(
            "/api/analytics/timeline?{}&bucket=hour&include_archived=true",
            window(&t)
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sent: u64 = json
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["sent"].as_u64().unwrap())
        .sum();
    assert_eq!(sent, 2);

    let (status, json) = send(
        &t.app,
        get(&format!("/api/analytics/users/{}?{}", t.user, window(&t))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_notifications"], 1);
    assert_eq!(json["preferred_channel"], "in_app");
}

#[tokio::test]
async fn test_analytics_rejects_inverted_range() {
    let t = build_test_app();
    let start = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let end = (Utc::now() - Duration::days(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let (status, _) = send(
        &t.app,
        get(&format!(
            "/api/analytics/engagement?tenant_id={}&start={start}&end={end}",
            t.tenant
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
