//! Realtime change-feed subscription with reconnection.
//!
//! [`RealtimeManager`] owns one tenant-scoped subscription on a table and
//! keeps it alive:
//!
//! - channel errors, timeouts and unexpected closes schedule a reconnect with
//!   exponential backoff (`base_delay * 2^(attempt-1)`)
//! - after `max_retries` automatic attempts the status becomes
//!   [`ConnectionStatus::Failed`] and only [`RealtimeManager::retry`] or an
//!   external trigger reconnects
//! - a heartbeat forces a reconnect when a subscribed channel has been silent
//!   for longer than `stale_after`
//! - becoming visible or coming back online reconnects with a fresh retry
//!   budget
//!
//! At most one setup runs at a time. Each setup starts a new epoch; messages,
//! timers and drivers from older epochs are ignored, so events that arrive
//! after [`RealtimeManager::shutdown`] never reach the handler.

use crate::config::RealtimeConfig;
use crate::events::{BookingEvent, EventBus};
use crate::gateway::{
    ChangeEvent, ChannelMessage, ChannelStatus, StoreGateway, Subscription, SubscriptionHandle,
};
use crate::observability::{NoOpMetrics, SyncMetrics};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Callback invoked for every change event of the current subscription.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`ChangeHandler`].
pub fn change_handler<F, Fut>(f: F) -> ChangeHandler
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)) as BoxFuture<'static, ()>)
}

/// Connection state of a [`RealtimeManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Subscribed,
    /// The channel reported an error; a retry may be scheduled.
    Error,
    /// The channel timed out; a retry may be scheduled.
    TimedOut,
    /// Automatic retries are exhausted.
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Subscribed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Subscribed => "subscribed",
            ConnectionStatus::Error => "error",
            ConnectionStatus::TimedOut => "timed out",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Table and tenant a subscription listens to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub table: String,
    pub tenant_column: String,
    pub tenant_id: String,
}

impl SubscriptionTarget {
    pub fn new(
        table: impl Into<String>,
        tenant_column: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        SubscriptionTarget {
            table: table.into(),
            tenant_column: tenant_column.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

struct State {
    status: ConnectionStatus,
    attempts: u32,
    handle: Option<SubscriptionHandle>,
    epoch: u64,
    retry_epoch: u64,
    last_event: Option<Instant>,
    hidden: bool,
    offline: bool,
    shut_down: bool,
    driver: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Default for State {
    fn default() -> Self {
        State {
            status: ConnectionStatus::Idle,
            attempts: 0,
            handle: None,
            epoch: 0,
            retry_epoch: 0,
            last_event: None,
            hidden: false,
            offline: false,
            shut_down: false,
            driver: None,
            heartbeat: None,
        }
    }
}

struct Inner<G> {
    gateway: G,
    target: SubscriptionTarget,
    config: RealtimeConfig,
    handler: ChangeHandler,
    events: EventBus,
    metrics: Arc<dyn SyncMetrics>,
    setup_in_progress: AtomicBool,
    state: Mutex<State>,
}

/// Builder for [`RealtimeManager`].
pub struct RealtimeBuilder<G> {
    gateway: G,
    target: SubscriptionTarget,
    handler: ChangeHandler,
    config: RealtimeConfig,
    events: EventBus,
    metrics: Arc<dyn SyncMetrics>,
}

impl<G: StoreGateway> RealtimeBuilder<G> {
    pub fn config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish connection and retry events on `events`.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> RealtimeManager<G> {
        RealtimeManager {
            inner: Arc::new(Inner {
                gateway: self.gateway,
                target: self.target,
                config: self.config,
                handler: self.handler,
                events: self.events,
                metrics: self.metrics,
                setup_in_progress: AtomicBool::new(false),
                state: Mutex::new(State::default()),
            }),
        }
    }
}

/// Owner of one realtime subscription.
///
/// Dropping the manager shuts the subscription down.
///
/// # Example
///
/// ```no_run
/// use booking_sync::gateway::InMemoryStore;
/// use booking_sync::realtime::{change_handler, RealtimeManager, SubscriptionTarget};
///
/// #[tokio::main]
/// async fn main() {
///     let handler = change_handler(|event| async move {
///         println!("{:?} on {}", event.kind, event.table);
///     });
///
///     let manager = RealtimeManager::builder(
///         InMemoryStore::new(),
///         SubscriptionTarget::new("online_bookings", "salon_id", "salon-1"),
///         handler,
///     )
///     .build();
///
///     manager.start().await;
///     // ...
///     manager.shutdown().await;
/// }
/// ```
pub struct RealtimeManager<G: StoreGateway> {
    inner: Arc<Inner<G>>,
}

impl<G: StoreGateway> RealtimeManager<G> {
    pub fn builder(
        gateway: G,
        target: SubscriptionTarget,
        handler: ChangeHandler,
    ) -> RealtimeBuilder<G> {
        RealtimeBuilder {
            gateway,
            target,
            handler,
            config: RealtimeConfig::default(),
            events: EventBus::new(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Subscribe and start the heartbeat.
    pub async fn start(&self) {
        let spawn_heartbeat = {
            let st = self.inner.lock();
            !st.shut_down && st.heartbeat.is_none()
        };
        if spawn_heartbeat {
            let heartbeat = self.inner.spawn_heartbeat();
            self.inner.lock().heartbeat = Some(heartbeat);
        }
        self.inner.connect().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Consecutive failures since the last successful subscribe.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.inner.target
    }

    /// Reconnect now with a fresh retry budget.
    ///
    /// Returns `false` if another setup was already running.
    pub async fn retry(&self) -> bool {
        info!("realtime {}: manual retry", self.inner.target.table);
        self.force_reconnect().await
    }

    /// Report a visibility change of the host. Becoming visible after being
    /// hidden reconnects.
    pub async fn on_visibility_change(&self, visible: bool) {
        let reconnect = {
            let mut st = self.inner.lock();
            let was_hidden = st.hidden;
            st.hidden = !visible;
            visible && was_hidden && !st.shut_down
        };
        if reconnect {
            info!("realtime {}: visible again, reconnecting", self.inner.target.table);
            self.force_reconnect().await;
        }
    }

    /// Report a network change. Coming back online reconnects.
    pub async fn on_network_change(&self, online: bool) {
        let reconnect = {
            let mut st = self.inner.lock();
            let was_offline = st.offline;
            st.offline = !online;
            online && was_offline && !st.shut_down
        };
        if reconnect {
            info!("realtime {}: back online, reconnecting", self.inner.target.table);
            self.force_reconnect().await;
        }
    }

    /// Close the subscription and stop every background task.
    pub async fn shutdown(&self) {
        let handle = match self.inner.stop() {
            Some(handle) => handle,
            None => return,
        };
        if let Some(handle) = handle {
            if let Err(e) = self.inner.gateway.unsubscribe(handle).await {
                warn!("realtime {}: unsubscribe failed: {}", self.inner.target.table, e);
            }
        }
        self.inner.set_status(ConnectionStatus::Closed);
        info!("realtime {}: shut down", self.inner.target.table);
    }

    async fn force_reconnect(&self) -> bool {
        {
            let mut st = self.inner.lock();
            if st.shut_down {
                return false;
            }
            st.attempts = 0;
            st.retry_epoch += 1;
        }
        self.inner.connect().await
    }
}

impl<G: StoreGateway> Drop for RealtimeManager<G> {
    fn drop(&mut self) {
        if let Some(Some(handle)) = self.inner.stop() {
            let inner = Arc::clone(&self.inner);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = inner.gateway.unsubscribe(handle).await;
                });
            }
        }
    }
}

impl<G: StoreGateway> Inner<G> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, epoch: u64) -> bool {
        let st = self.lock();
        !st.shut_down && st.epoch == epoch
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut st = self.lock();
            if st.status == status {
                false
            } else {
                st.status = status;
                true
            }
        };
        if changed {
            debug!("realtime {}: {}", self.target.table, status);
            self.events.publish(BookingEvent::ConnectionChanged(status));
        }
    }

    /// Mark shut down and cancel tasks. Returns `None` if already stopped,
    /// otherwise the handle still to be unsubscribed.
    fn stop(&self) -> Option<Option<SubscriptionHandle>> {
        let mut st = self.lock();
        if st.shut_down {
            return None;
        }
        st.shut_down = true;
        st.epoch += 1;
        st.retry_epoch += 1;
        if let Some(driver) = st.driver.take() {
            driver.abort();
        }
        if let Some(heartbeat) = st.heartbeat.take() {
            heartbeat.abort();
        }
        Some(st.handle.take())
    }

    /// Run one setup unless another one is in progress.
    async fn connect(self: &Arc<Self>) -> bool {
        if self.setup_in_progress.swap(true, Ordering::SeqCst) {
            debug!("realtime {}: setup already in progress", self.target.table);
            return false;
        }
        self.setup().await;
        self.setup_in_progress.store(false, Ordering::SeqCst);
        true
    }

    async fn setup(self: &Arc<Self>) {
        let (previous, epoch) = {
            let mut st = self.lock();
            if st.shut_down {
                return;
            }
            st.epoch += 1;
            st.retry_epoch += 1;
            if let Some(driver) = st.driver.take() {
                driver.abort();
            }
            (st.handle.take(), st.epoch)
        };

        self.set_status(ConnectionStatus::Connecting);

        if let Some(handle) = previous {
            if let Err(e) = self.gateway.unsubscribe(handle).await {
                warn!("realtime {}: closing old channel failed: {}", self.target.table, e);
            }
        }

        let subscribed = self
            .gateway
            .subscribe(
                &self.target.table,
                &self.target.tenant_column,
                &self.target.tenant_id,
            )
            .await;

        let Subscription { handle, messages } = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("realtime {}: subscribe failed: {}", self.target.table, e);
                self.on_failure(epoch, ConnectionStatus::Error, &e.to_string());
                return;
            }
        };

        let superseded = {
            let mut st = self.lock();
            if st.shut_down || st.epoch != epoch {
                true
            } else {
                st.handle = Some(handle);
                let inner = Arc::clone(self);
                st.driver = Some(tokio::spawn(inner.drive(epoch, messages)));
                false
            }
        };
        if superseded {
            let _ = self.gateway.unsubscribe(handle).await;
        }
    }

    /// Consume channel messages for one epoch.
    async fn drive(self: Arc<Self>, epoch: u64, mut messages: mpsc::UnboundedReceiver<ChannelMessage>) {
        while let Some(message) = messages.recv().await {
            if !self.is_current(epoch) {
                return;
            }
            match message {
                ChannelMessage::Status(ChannelStatus::Subscribed) => {
                    {
                        let mut st = self.lock();
                        st.attempts = 0;
                        st.last_event = Some(Instant::now());
                    }
                    self.set_status(ConnectionStatus::Subscribed);
                    info!(
                        "✓ realtime {} subscribed ({}={})",
                        self.target.table, self.target.tenant_column, self.target.tenant_id
                    );
                }
                ChannelMessage::Status(ChannelStatus::ChannelError(reason)) => {
                    self.on_failure(epoch, ConnectionStatus::Error, &reason);
                    return;
                }
                ChannelMessage::Status(ChannelStatus::TimedOut) => {
                    self.on_failure(epoch, ConnectionStatus::TimedOut, "timed out");
                    return;
                }
                ChannelMessage::Status(ChannelStatus::Closed) => {
                    self.on_failure(epoch, ConnectionStatus::Error, "closed by server");
                    return;
                }
                ChannelMessage::Change(event) => {
                    self.lock().last_event = Some(Instant::now());
                    self.metrics.record_change_event(&event.table);
                    (self.handler)(event).await;
                }
            }
        }

        if self.is_current(epoch) {
            self.on_failure(epoch, ConnectionStatus::Error, "channel ended");
        }
    }

    /// Schedule a reconnect, or give up once the retry budget is spent.
    fn on_failure(self: &Arc<Self>, epoch: u64, status: ConnectionStatus, reason: &str) {
        let next = {
            let mut st = self.lock();
            if st.shut_down || st.epoch != epoch {
                return;
            }
            st.attempts += 1;
            if st.attempts > self.config.max_retries {
                Err(st.handle.take())
            } else {
                st.retry_epoch += 1;
                Ok((st.attempts, st.retry_epoch))
            }
        };

        match next {
            Ok((attempt, retry_epoch)) => {
                let delay = self.config.backoff_delay(attempt);
                self.set_status(status);
                warn!(
                    "realtime {}: {} ({}), retry {}/{} in {:?}",
                    self.target.table, status, reason, attempt, self.config.max_retries, delay
                );
                self.metrics.record_retry(attempt, delay);
                self.events
                    .publish(BookingEvent::RetryScheduled { attempt, delay });

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let still_wanted = {
                        let st = inner.lock();
                        !st.shut_down && st.retry_epoch == retry_epoch
                    };
                    if still_wanted {
                        inner.connect().await;
                    }
                });
            }
            Err(handle) => {
                self.set_status(ConnectionStatus::Failed);
                warn!(
                    "realtime {}: {} ({}), giving up after {} retries",
                    self.target.table, status, reason, self.config.max_retries
                );
                if let Some(handle) = handle {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = inner.gateway.unsubscribe(handle).await;
                    });
                }
            }
        }
    }

    fn is_stale(&self) -> bool {
        let st = self.lock();
        st.status == ConnectionStatus::Subscribed
            && st
                .last_event
                .map_or(false, |at| at.elapsed() > self.config.stale_after)
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if inner.is_stale() {
                    warn!(
                        "realtime {}: no traffic for {:?}, reconnecting",
                        inner.target.table, inner.config.stale_after
                    );
                    inner.lock().attempts = 0;
                    inner.connect().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryStore;
    use std::time::Duration;

    fn noop_handler() -> ChangeHandler {
        change_handler(|_event| async {})
    }

    fn manager(store: &InMemoryStore) -> RealtimeManager<InMemoryStore> {
        RealtimeManager::builder(
            store.clone(),
            SubscriptionTarget::new("online_bookings", "salon_id", "salon-1"),
            noop_handler(),
        )
        .build()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::TimedOut.to_string(), "timed out");
        assert!(ConnectionStatus::Subscribed.is_connected());
        assert!(!ConnectionStatus::Failed.is_connected());
    }

    #[tokio::test]
    async fn test_start_subscribes() {
        let store = InMemoryStore::new();
        let manager = manager(&store);

        manager.start().await;
        settle().await;

        assert_eq!(manager.status(), ConnectionStatus::Subscribed);
        assert_eq!(store.subscription_count(), 1);
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let store = InMemoryStore::new();
        let manager = manager(&store);
        manager.start().await;
        settle().await;

        manager.shutdown().await;
        assert_eq!(manager.status(), ConnectionStatus::Closed);
        assert_eq!(store.subscription_count(), 0);

        // A second shutdown and a retry after shutdown are no-ops.
        manager.shutdown().await;
        assert!(!manager.retry().await);
    }

    #[tokio::test]
    async fn test_concurrent_setup_is_skipped() {
        let store = InMemoryStore::new();
        let manager = manager(&store);

        manager.inner.setup_in_progress.store(true, Ordering::SeqCst);
        assert!(!manager.retry().await);
        assert_eq!(store.subscription_count(), 0);

        manager.inner.setup_in_progress.store(false, Ordering::SeqCst);
        assert!(manager.retry().await);
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_schedules_retry() {
        let store = InMemoryStore::new();
        store.fail_subscriptions(1);
        let manager = manager(&store);
        let mut events = manager.inner.events.subscribe();

        manager.start().await;
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Subscribed);
        assert_eq!(manager.attempts(), 0);
        assert_eq!(store.subscription_count(), 1);

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            if let BookingEvent::RetryScheduled { attempt, delay } = event {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(1));
                saw_retry = true;
            }
        }
        assert!(saw_retry);
    }
}
