use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use changewatch::{
    ChangeEvent, ChangeFeed, FeedHub, OperationType, SubscriptionConfig, SubscriptionError, SubscriptionHub,
    SubscriptionItem,
};

fn update(coll: &str, id: &str, n: i64) -> ChangeEvent {
    ChangeEvent::new(OperationType::Update, "app", coll, id).with_full_document(json!({"_id": id, "n": n}))
}

fn hub() -> (Arc<FeedHub>, SubscriptionHub) {
    let feed = Arc::new(FeedHub::new());
    let subs = SubscriptionHub::new(Arc::clone(&feed) as Arc<dyn ChangeFeed>, SubscriptionConfig::default());
    (feed, subs)
}

fn change_n(item: &SubscriptionItem) -> i64 {
    match item {
        SubscriptionItem::Change(ev) => ev.full_document.as_ref().unwrap()["n"].as_i64().unwrap(),
        other => panic!("expected change, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribers_never_see_other_documents() {
    let (feed, subs) = hub();
    let mut a = subs.subscribe("tasks", "a");
    let mut b = subs.subscribe("tasks", "b");
    let mut other_coll = subs.subscribe("notes", "a");

    for n in 0..10 {
        let id = if n % 2 == 0 { "a" } else { "b" };
        feed.emit_change(update("tasks", id, n)).await.unwrap();
    }
    feed.emit_end().await.unwrap();

    let mut seen_a = Vec::new();
    while let Some(item) = a.next().await {
        if item.is_terminal() {
            assert_eq!(item, SubscriptionItem::End);
            continue;
        }
        seen_a.push(change_n(&item));
    }
    let seen_b: Vec<i64> = b
        .into_stream()
        .filter(|item| futures::future::ready(!item.is_terminal()))
        .map(|item| change_n(&item))
        .collect()
        .await;

    assert_eq!(seen_a, vec![0, 2, 4, 6, 8]);
    assert_eq!(seen_b, vec![1, 3, 5, 7, 9]);
    assert_eq!(other_coll.next().await, Some(SubscriptionItem::End));
    assert_eq!(other_coll.next().await, None);
}

#[tokio::test]
async fn cancel_unblocks_a_pending_pull() {
    let (feed, subs) = hub();
    let mut sub = subs.subscribe("tasks", "a");
    let cancel = sub.cancel_handle();

    let pull = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pull.is_finished());

    cancel.cancel();
    let item = tokio::time::timeout(Duration::from_secs(1), pull)
        .await
        .expect("pull resolves after cancel")
        .unwrap();
    assert_eq!(item, None);
    assert_eq!(subs.active(), 0);
    assert_eq!(feed.listener_count(), 0);
}

#[tokio::test]
async fn feed_error_reaches_every_open_subscription_once() {
    let (feed, subs) = hub();
    let mut open: Vec<_> = ["a", "b", "c"].iter().map(|id| subs.subscribe("tasks", *id)).collect();
    let cancelled = subs.subscribe("tasks", "d");
    cancelled.cancel();

    feed.emit_error("cursor killed").await.unwrap();

    for sub in &mut open {
        assert_eq!(
            sub.next().await,
            Some(SubscriptionItem::Error(SubscriptionError::Feed {
                message: "cursor killed".to_string(),
            }))
        );
        assert_eq!(sub.next().await, None);
    }
    assert_eq!(subs.active(), 0);
    assert_eq!(feed.listener_count(), 0);
}

#[tokio::test]
async fn subscriptions_share_the_feed_with_each_other() {
    let (feed, subs) = hub();
    let first = subs.subscribe("tasks", "a");
    let mut second = subs.subscribe("tasks", "a");
    assert_eq!(subs.active(), 2);

    drop(first);
    assert_eq!(subs.active(), 1);

    feed.emit_change(update("tasks", "a", 1)).await.unwrap();
    assert_eq!(change_n(&second.next().await.unwrap()), 1);
}
