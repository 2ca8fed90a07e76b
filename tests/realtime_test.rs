//! Realtime subscription tests.
//!
//! Timing tests run with a paused clock, so backoff delays and heartbeat
//! intervals elapse instantly and deterministically.

use booking_sync::gateway::{ChannelStatus, InMemoryStore, StoreGateway, StoreOp};
use booking_sync::realtime::{change_handler, RealtimeManager, SubscriptionTarget};
use booking_sync::{BookingEvent, ConnectionStatus, EventBus, RealtimeConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn manager(
    store: &InMemoryStore,
    events: &EventBus,
    seen: Arc<AtomicUsize>,
) -> RealtimeManager<InMemoryStore> {
    RealtimeManager::builder(
        store.clone(),
        SubscriptionTarget::new("online_bookings", "salon_id", "salon-1"),
        change_handler(move |_event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .config(RealtimeConfig::default())
    .events(events.clone())
    .build()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut broadcast::Receiver<BookingEvent>) -> Vec<BookingEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn insert_booking(store: &InMemoryStore, id: &str, salon: &str) {
    let row = json!({
        "id": id,
        "salon_id": salon,
        "customer_name": "Anna",
        "requested_date": "2024-05-01",
        "requested_time": "10:00",
        "status": "pending",
        "created_at": "2024-04-01T08:00:00Z"
    });
    store
        .insert("online_bookings", row.as_object().cloned().unwrap())
        .await
        .expect("Failed to insert booking");
}

/// Repeated CHANNEL_ERRORs produce exactly `max_retries` retries with
/// strictly increasing delays, then `Failed` and no further attempts.
#[tokio::test(start_paused = true)]
async fn test_backoff_is_bounded() {
    let store = InMemoryStore::new();
    store.fail_subscriptions(100);
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;

    tokio::time::timeout(Duration::from_secs(60), async {
        while manager.status() != ConnectionStatus::Failed {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Failed to reach failed state");

    let retries: Vec<(u32, Duration)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            BookingEvent::RetryScheduled { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();

    assert_eq!(
        retries,
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
        ]
    );
    assert!(retries.windows(2).all(|w| w[0].1 < w[1].1));
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 4);

    // No automatic retries once failed.
    tokio::time::sleep(Duration::from_secs(600)).await;
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::Failed);
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 4);
    assert!(drain(&mut rx)
        .iter()
        .all(|e| !matches!(e, BookingEvent::RetryScheduled { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_manual_retry_after_failure() {
    let store = InMemoryStore::new();
    store.fail_subscriptions(4);
    let events = EventBus::new();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::Failed);

    assert!(manager.retry().await);
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::Subscribed);
    assert_eq!(manager.attempts(), 0);
    assert_eq!(store.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_transport_error_is_retried() {
    let store = InMemoryStore::new();
    store.fail_next(StoreOp::Subscribe, "online_bookings");
    let events = EventBus::new();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;
    assert_eq!(manager.status(), ConnectionStatus::Error);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_recovery() {
    let store = InMemoryStore::new();
    let events = EventBus::new();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;
    settle().await;
    assert!(manager.is_connected());

    store.emit_status(ChannelStatus::TimedOut);
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::TimedOut);
    assert_eq!(manager.attempts(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    settle().await;
    assert!(manager.is_connected());
    assert_eq!(manager.attempts(), 0);
    assert_eq!(store.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_changes_are_tenant_scoped() {
    let store = InMemoryStore::new();
    let events = EventBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let manager = manager(&store, &events, Arc::clone(&seen));

    manager.start().await;
    settle().await;

    insert_booking(&store, "b1", "salon-1").await;
    insert_booking(&store, "b2", "salon-2").await;
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
    insert_booking(&store, "b3", "salon-1").await;
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

/// A subscribed channel with no traffic for longer than the stale window is
/// torn down and re-established by the heartbeat.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_reconnects_silent_channel() {
    let store = InMemoryStore::new();
    let events = EventBus::new();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;
    settle().await;
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 1);

    // Traffic keeps the channel fresh.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(40)).await;
        insert_booking(&store, &format!("b-{}", next_suffix()), "salon-1").await;
        settle().await;
    }
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 1);

    // Silence past the stale window triggers a reconnect.
    tokio::time::sleep(Duration::from_secs(155)).await;
    settle().await;
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 2);
    assert!(manager.is_connected());
    assert_eq!(store.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_visibility_and_network_triggers() {
    let store = InMemoryStore::new();
    let events = EventBus::new();
    let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));

    manager.start().await;
    settle().await;

    // Visible without having been hidden: nothing to do.
    manager.on_visibility_change(true).await;
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 1);

    manager.on_visibility_change(false).await;
    manager.on_visibility_change(true).await;
    settle().await;
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 2);

    manager.on_network_change(false).await;
    manager.on_network_change(true).await;
    settle().await;
    assert_eq!(store.calls(StoreOp::Subscribe, "online_bookings"), 3);
    assert!(manager.is_connected());
    assert_eq!(store.subscription_count(), 1);
}

#[tokio::test]
async fn test_drop_closes_subscription() {
    let store = InMemoryStore::new();
    let events = EventBus::new();
    {
        let manager = manager(&store, &events, Arc::new(AtomicUsize::new(0)));
        manager.start().await;
        assert_eq!(store.subscription_count(), 1);
    }
    settle().await;
    assert_eq!(store.subscription_count(), 0);
}

fn next_suffix() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::SeqCst)
}
