use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use pushline_core::PlanTable;
use pushline_delivery::adapters::{AdapterSet, EmailAdapter, ExpoPushAdapter, WebhookAdapter};
use pushline_delivery::{Dispatcher, SmtpConfig};
use pushline_server::config::RateLimitConfig;
use pushline_server::{AppState, build_app};
use pushline_storage::{AccountStorage, DynStorage, MemoryStorage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestServer {
    base: String,
    storage: DynStorage,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

/// Plans with every gate open, for tests that are not about entitlements.
fn permissive_plans() -> PlanTable {
    let mut plans = PlanTable::default();
    plans.free.topics = None;
    plans.free.private_topics = true;
    plans.free.webhooks = true;
    plans
}

async fn start_server(plans: PlanTable, rate_limit: RateLimitConfig) -> TestServer {
    let storage: DynStorage = Arc::new(MemoryStorage::new());
    let adapters = Arc::new(AdapterSet::new(
        WebhookAdapter::new(),
        EmailAdapter::new(SmtpConfig::default()),
        ExpoPushAdapter::default(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        adapters,
        Duration::from_secs(5),
        5,
    ));
    let app = build_app(AppState {
        storage: storage.clone(),
        dispatcher,
        plans: Arc::new(plans),
        rate_limit,
    });

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        storage,
        shutdown: tx,
        handle,
    }
}

async fn create_topic(
    client: &reqwest::Client,
    base: &str,
    user: &str,
    name: &str,
    is_private: bool,
) -> Value {
    let resp = client
        .post(format!("{base}/topics"))
        .header("x-user-id", user)
        .json(&json!({ "name": name, "is_private": is_private }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "topic creation failed");
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_and_info_endpoints() {
    let server = start_server(PlanTable::default(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["service"], "Pushline");
    assert_eq!(body["status"], "ok");

    for (route, expected) in [("/healthz", "ok"), ("/readyz", "ready")] {
        let body: Value = client
            .get(format!("{}{route}", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], expected);
    }

    server.stop().await;
}

#[tokio::test]
async fn push_to_public_topic_is_retrievable() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    create_topic(&client, &server.base, "u1", "temp-alerts", false).await;

    let resp = client
        .post(format!("{}/push/temp-alerts", server.base))
        .header("Title", "Warm")
        .body("28C")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["topic"], "temp-alerts");
    assert_eq!(body["subscribers"], 0);
    let id = body["id"].as_str().unwrap().to_owned();
    assert!(body["timestamp"].as_str().is_some());

    let history: Value = client
        .get(format!("{}/push/temp-alerts?limit=1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 1);
    assert_eq!(history["messages"][0]["id"], id.as_str());
    assert_eq!(history["messages"][0]["title"], "Warm");
    assert_eq!(history["messages"][0]["message"], "28C");

    server.stop().await;
}

#[tokio::test]
async fn private_topic_requires_the_api_key() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let topic = create_topic(&client, &server.base, "u1", "secrets", true).await;
    let api_key = topic["api_key"].as_str().unwrap().to_owned();

    // No credential and a wrong credential are both rejected.
    for auth in [None, Some("Bearer wrong")] {
        let mut req = client
            .post(format!("{}/push/secrets", server.base))
            .body("psst");
        if let Some(value) = auth {
            req = req.header("authorization", value);
        }
        let resp = req.send().await.unwrap();
        assert_eq!(resp.status(), 401);
    }

    // Nothing was persisted by the rejected pushes.
    let history: Value = client
        .get(format!("{}/push/secrets", server.base))
        .header("authorization", format!("Bearer {api_key}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 0);

    let resp = client
        .post(format!("{}/push/secrets", server.base))
        .header("authorization", format!("Bearer {api_key}"))
        .body("psst")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    server.stop().await;
}

#[tokio::test]
async fn unknown_topic_is_404_and_empty_message_400() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/push/nope", server.base))
        .body("hi")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    create_topic(&client, &server.base, "u1", "blank", false).await;
    let resp = client
        .post(format!("{}/push/blank", server.base))
        .body("   ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn quota_boundary_and_monthly_reset() {
    let mut plans = permissive_plans();
    plans.free.pushes = 2;
    let server = start_server(plans, RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    create_topic(&client, &server.base, "u1", "metered", false).await;
    let push = || {
        client
            .post(format!("{}/push/metered", server.base))
            .body("tick")
            .send()
    };

    assert_eq!(push().await.unwrap().status(), 200);
    assert_eq!(push().await.unwrap().status(), 200);

    let resp = push().await.unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["plan"], "free");
    assert_eq!(body["used"], 2);
    assert_eq!(body["limit"], 2);

    // Simulate the month rolling over, then the next push admits again.
    let past = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
    server.storage.accounts().reset_usage("u1", past).await.unwrap();
    assert_eq!(push().await.unwrap().status(), 200);
    let account = server
        .storage
        .accounts()
        .get_account("u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.pushes_used, 1);

    server.stop().await;
}

#[tokio::test]
async fn rejected_push_does_not_consume_quota() {
    let mut plans = permissive_plans();
    plans.free.pushes = 1;
    let server = start_server(plans, RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    create_topic(&client, &server.base, "u1", "strict", false).await;

    let resp = client
        .post(format!("{}/push/strict", server.base))
        .body("   ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let used = server
        .storage
        .accounts()
        .get_account("u1")
        .await
        .unwrap()
        .map_or(0, |a| a.pushes_used);
    assert_eq!(used, 0);

    // The single admitted unit is still available.
    let resp = client
        .post(format!("{}/push/strict", server.base))
        .body("for real this time")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    server.stop().await;
}

#[tokio::test]
async fn rate_limiter_blocks_with_retry_after() {
    let rate_limit = RateLimitConfig {
        window_ms: 60_000,
        push_per_window: 2,
        pushover_per_window: 100,
    };
    let server = start_server(permissive_plans(), rate_limit).await;
    let client = reqwest::Client::new();

    create_topic(&client, &server.base, "u1", "busy", false).await;
    let push = |ip: &'static str| {
        client
            .post(format!("{}/push/busy", server.base))
            .header("x-forwarded-for", ip)
            .body("hi")
            .send()
    };

    assert_eq!(push("9.9.9.9").await.unwrap().status(), 200);
    assert_eq!(push("9.9.9.9").await.unwrap().status(), 200);
    let resp = push("9.9.9.9").await.unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().get("retry-after").is_some());

    // Another client is unaffected.
    assert_eq!(push("8.8.8.8").await.unwrap().status(), 200);

    server.stop().await;
}

#[tokio::test]
async fn pushover_priorities_map_onto_the_scale() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let topic = create_topic(&client, &server.base, "u1", "po", false).await;
    let token = topic["api_key"].as_str().unwrap().to_owned();

    for (priority, expected) in [
        ("-2", "lowest"),
        ("-1", "low"),
        ("0", "normal"),
        ("1", "high"),
        ("2", "urgent"),
        ("5", "urgent"),
        ("abc", "normal"),
    ] {
        let resp = client
            .post(format!("{}/1/messages.json", server.base))
            .form(&[("token", token.as_str()), ("message", "m"), ("priority", priority)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], 1);
        assert!(body["request"].as_str().is_some());

        let history: Value = client
            .get(format!("{}/push/po?limit=1", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history["messages"][0]["priority"], expected);
    }

    server.stop().await;
}

#[tokio::test]
async fn pushover_free_plan_suffix_and_user_fallback() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    create_topic(&client, &server.base, "u1", "open", false).await;

    // The token parameter is mandatory, even when `user` would resolve.
    let resp = client
        .post(format!("{}/pushover", server.base))
        .form(&[("user", "open"), ("message", "hello")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 0);

    // Bad token, public topic name as `user`: the fallback path.
    let resp = client
        .post(format!("{}/pushover", server.base))
        .form(&[("token", "bogus"), ("user", "open"), ("message", "hello")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let history: Value = client
        .get(format!("{}/push/open?limit=1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stored = history["messages"][0]["message"].as_str().unwrap();
    assert_eq!(stored, "hello • via pushline");

    // Paid plans publish the message untouched.
    server
        .storage
        .accounts()
        .set_plan("u1", pushline_core::Plan::Pro)
        .await
        .unwrap();
    let resp = client
        .post(format!("{}/pushover", server.base))
        .form(&[("token", "bogus"), ("user", "open"), ("message", "clean")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let history: Value = client
        .get(format!("{}/push/open?limit=1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["messages"][0]["message"], "clean");

    // Blank message is a Pushover-style error envelope.
    let resp = client
        .post(format!("{}/pushover", server.base))
        .form(&[("token", "bogus"), ("user", "open"), ("message", "  ")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 0);
    assert!(body["errors"].as_array().is_some_and(|e| !e.is_empty()));

    server.stop().await;
}

#[tokio::test]
async fn fan_out_isolates_a_broken_webhook() {
    let hooks = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hooks)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&hooks)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hooks)
        .await;

    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let topic = create_topic(&client, &server.base, "u1", "fleet", false).await;
    let topic_id = topic["id"].as_str().unwrap().to_owned();

    for suffix in ["/ok1", "/broken", "/ok2"] {
        let resp = client
            .post(format!("{}/topics/{topic_id}/subscribers", server.base))
            .header("x-user-id", "u1")
            .json(&json!({ "endpoint": format!("{}{suffix}", hooks.uri()), "type": "webhook" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }

    let resp = client
        .post(format!("{}/push/fleet", server.base))
        .body("rollout done")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["subscribers"], 3);

    server.stop().await;
}

#[tokio::test]
async fn topic_management_enforces_identity_and_plan() {
    // Default plans: free gets one topic, no private topics.
    let server = start_server(PlanTable::default(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    // No identity header.
    let resp = client
        .post(format!("{}/topics", server.base))
        .json(&json!({ "name": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Name is sanitized on the way in.
    let topic = create_topic(&client, &server.base, "u1", "My Sensor!!", false).await;
    assert_eq!(topic["name"], "my-sensor");

    // Duplicate name.
    let resp = client
        .post(format!("{}/topics", server.base))
        .header("x-user-id", "u2")
        .json(&json!({ "name": "my-sensor" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Free plan: one topic only.
    let resp = client
        .post(format!("{}/topics", server.base))
        .header("x-user-id", "u1")
        .json(&json!({ "name": "second" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Free plan: no private topics.
    let resp = client
        .post(format!("{}/topics", server.base))
        .header("x-user-id", "u3")
        .json(&json!({ "name": "vault", "is_private": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    server.stop().await;
}

#[tokio::test]
async fn subscriber_upsert_reactivates_and_delete_cascades() {
    let server = start_server(permissive_plans(), RateLimitConfig::default()).await;
    let client = reqwest::Client::new();

    let topic = create_topic(&client, &server.base, "u1", "subs", false).await;
    let topic_id = topic["id"].as_str().unwrap().to_owned();
    let subscribe = |endpoint: &'static str, channel: &'static str| {
        client
            .post(format!("{}/topics/{topic_id}/subscribers", server.base))
            .header("x-user-id", "u1")
            .json(&json!({ "endpoint": endpoint, "type": channel }))
            .send()
    };

    let resp = subscribe("ops@example.com", "email").await.unwrap();
    assert_eq!(resp.status(), 201);
    let first: Value = resp.json().await.unwrap();

    // Same endpoint again: reactivated, not duplicated.
    let resp = subscribe("ops@example.com", "email").await.unwrap();
    assert_eq!(resp.status(), 200);
    let second: Value = resp.json().await.unwrap();
    assert_eq!(first["id"], second["id"]);

    // Unknown channel type.
    let resp = subscribe("x", "carrier_pigeon").await.unwrap();
    assert_eq!(resp.status(), 400);

    let listing: Value = client
        .get(format!("{}/topics/{topic_id}/subscribers", server.base))
        .header("x-user-id", "u1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 1);

    // Someone else cannot see or delete them.
    let resp = client
        .get(format!("{}/topics/{topic_id}/subscribers", server.base))
        .header("x-user-id", "intruder")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let sub_id = first["id"].as_str().unwrap();
    let resp = client
        .delete(format!(
            "{}/topics/{topic_id}/subscribers/{sub_id}",
            server.base
        ))
        .header("x-user-id", "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Deleting the topic removes its history.
    let resp = client
        .delete(format!("{}/topics/{topic_id}", server.base))
        .header("x-user-id", "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client
        .get(format!("{}/push/subs", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}
