use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use changewatch::{
    AlertDeps, AlertRule, AlertService, ChangeEvent, ChangeFeed, DeliveryError, DispatchHandle, Dispatcher, FeedHub,
    InMemoryLeaseStore, InMemoryRuleStore, LeaderGate, LeaseManager, LeaseManagerConfig, LeaseStore, Notification,
    Notifier, OperationType, RuleCache, RuleEventType, RuleStore, WatchConfig, WebhookNotifier,
};

fn insert(coll: &str, doc: Value) -> ChangeEvent {
    let id = doc["_id"].clone();
    ChangeEvent::new(OperationType::Insert, "shop", coll, id).with_full_document(doc)
}

async fn cache_with(rules: Vec<AlertRule>) -> Arc<RuleCache> {
    let store: Arc<dyn RuleStore> = Arc::new(InMemoryRuleStore::with_rules(rules));
    let cache = Arc::new(RuleCache::new(store, Duration::from_secs(30)));
    cache.reload().await.unwrap();
    cache
}

async fn leader() -> Arc<LeaseManager> {
    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let lease = Arc::new(LeaseManager::new(LeaseManagerConfig::default(), store));
    assert!(lease.renew().await);
    lease
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Notification>>,
}

impl Recorder {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|n| n.text.clone()).collect()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, n: &Notification) -> Result<Value, DeliveryError> {
        self.sent.lock().unwrap().push(n.clone());
        Ok(Value::Null)
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

/// Enqueues a follow-up event while the first one is being delivered.
struct Reentrant {
    queue: OnceLock<DispatchHandle>,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Reentrant {
    async fn notify(&self, n: &Notification) -> Result<Value, DeliveryError> {
        self.seen.lock().unwrap().push(n.text.clone());
        if n.text == "a" {
            let queue = self.queue.get().expect("queue installed before first event");
            queue.enqueue(insert("orders", json!({"_id": "c"}))).unwrap();
        }
        Ok(Value::Null)
    }

    fn name(&self) -> &str {
        "reentrant"
    }
}

#[tokio::test]
async fn reentrant_enqueue_runs_after_already_queued_events() {
    let rules = cache_with(vec![AlertRule::new("r", RuleEventType::Insert, "#c", "{{_id}}")]).await;
    let notifier = Arc::new(Reentrant {
        queue: OnceLock::new(),
        seen: Mutex::new(Vec::new()),
    });
    let handle = Dispatcher::new(
        leader().await as Arc<dyn LeaderGate>,
        rules,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    )
    .spawn();
    notifier.queue.set(handle.clone()).unwrap();

    handle.enqueue(insert("orders", json!({"_id": "a"}))).unwrap();
    handle.enqueue(insert("orders", json!({"_id": "b"}))).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while notifier.seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all three events delivered");

    handle.close();
    handle.join().await;
    assert_eq!(*notifier.seen.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn events_are_delivered_in_feed_order() {
    let rules = cache_with(vec![AlertRule::new("r", RuleEventType::Upsert, "#c", "{{_id}}")]).await;
    let recorder = Arc::new(Recorder::default());
    let feed = FeedHub::new();
    let handle = Dispatcher::new(
        leader().await as Arc<dyn LeaderGate>,
        rules,
        Arc::clone(&recorder) as Arc<dyn Notifier>,
    )
    .spawn();
    handle.attach(&feed);

    for i in 0..50 {
        feed.emit_change(insert("orders", json!({"_id": i}))).await.unwrap();
    }
    feed.emit_end().await.unwrap();
    handle.join().await;

    let expected: Vec<String> = (0..50).map(|i: i32| i.to_string()).collect();
    assert_eq!(recorder.texts(), expected);
    assert_eq!(handle.stats().delivered, 50);
}

type Captured = Arc<Mutex<Vec<Value>>>;

async fn capture(State(captured): State<Captured>, Json(body): Json<Value>) -> Json<Value> {
    captured.lock().unwrap().push(body);
    Json(json!({"ok": true}))
}

async fn serve(captured: Captured) -> String {
    let router = Router::new().route("/notifySlack", post(capture)).with_state(captured);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

fn webhook(base: &str) -> WebhookNotifier {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .no_proxy()
        .build()
        .unwrap();
    WebhookNotifier::with_client(client, base)
}

#[tokio::test]
async fn insert_on_watched_collection_posts_rendered_notification() {
    let captured: Captured = Arc::default();
    let base = serve(Arc::clone(&captured)).await;

    let rule = AlertRule::new("r1", RuleEventType::Insert, "#sales", "New order {{_id}} for {{total}}")
        .in_database("shop")
        .in_collection("orders")
        .in_workspace("ws1");
    let feed = Arc::new(FeedHub::new());
    let service = AlertService::start(
        &WatchConfig::default(),
        AlertDeps {
            feed: Arc::clone(&feed) as Arc<dyn ChangeFeed>,
            leases: Arc::new(InMemoryLeaseStore::new()),
            rules: Arc::new(InMemoryRuleStore::with_rules([rule])),
            notifier: Arc::new(webhook(&base)),
        },
    )
    .await
    .unwrap();

    feed.emit_change(insert("customers", json!({"_id": 1, "total": 5})))
        .await
        .unwrap();
    feed.emit_change(insert("orders", json!({"_id": 42, "total": 19.99})))
        .await
        .unwrap();
    feed.emit_end().await.unwrap();
    service.drained().await;

    let stats = service.stats();
    service.shutdown().await;

    let bodies = captured.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["channel"], "#sales");
    assert_eq!(bodies[0]["text"], "New order 42 for 19.99");
    assert_eq!(bodies[0]["workspaceId"], "ws1");
    assert_eq!(bodies[0]["collection"], "orders");
    assert_eq!(stats.received, 2);
    assert_eq!(stats.delivered, 1);
}

#[tokio::test]
async fn only_the_lease_holder_dispatches() {
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let rules: Arc<dyn RuleStore> = Arc::new(InMemoryRuleStore::with_rules([AlertRule::new(
        "r",
        RuleEventType::Insert,
        "#c",
        "{{_id}}",
    )]));
    let recorder = Arc::new(Recorder::default());
    let feed = Arc::new(FeedHub::new());

    let deps = || AlertDeps {
        feed: Arc::clone(&feed) as Arc<dyn ChangeFeed>,
        leases: Arc::clone(&leases),
        rules: Arc::clone(&rules),
        notifier: Arc::clone(&recorder) as Arc<dyn Notifier>,
    };
    let first = AlertService::start(&WatchConfig::default(), deps()).await.unwrap();
    let second = AlertService::start(&WatchConfig::default(), deps()).await.unwrap();
    assert!(first.lease().is_leader());
    assert!(!second.lease().is_leader());

    feed.emit_change(insert("orders", json!({"_id": "x"}))).await.unwrap();
    feed.emit_end().await.unwrap();
    first.drained().await;
    second.drained().await;

    assert_eq!(recorder.texts(), vec!["x"]);
    assert_eq!(first.stats().delivered, 1);
    assert_eq!(second.stats().skipped_not_leader, 1);

    first.shutdown().await;
    second.shutdown().await;
}
