//! High-level booking service for host applications.
//!
//! Bundles the store gateway, notifier, session, local cache and event bus
//! behind one cheaply clonable handle.

use crate::cache::{BookingCache, ViewFilter};
use crate::config::{BookingConfig, Session};
use crate::entity::{decode_rows, Record, Row};
use crate::error::{Error, Result};
use crate::events::{BookingEvent, EventBus};
use crate::gateway::{ChangeEvent, Filter, StoreGateway};
use crate::lifecycle::{self, StatusOutcome};
use crate::models::{BookingRequest, BookingStatus, TENANT_COLUMN};
use crate::notify::Notifier;
use crate::observability::{NoOpMetrics, SyncMetrics};
use crate::realtime::{change_handler, RealtimeManager, SubscriptionTarget};
use crate::strategy::FetchStrategy;
use crate::workflow::{self, ConversionOutcome, ConversionRequest, ReconcileReport};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// State shared by the service, the workflows and the realtime change handler.
pub(crate) struct Shared<G, N> {
    pub(crate) gateway: G,
    pub(crate) notifier: N,
    pub(crate) session: Session,
    pub(crate) config: BookingConfig,
    pub(crate) cache: RwLock<BookingCache>,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<dyn SyncMetrics>,
    pub(crate) in_flight: DashMap<String, Action>,
}

impl<G: StoreGateway, N: Notifier> Shared<G, N> {
    /// Load one booking request of the session's tenant from the store.
    pub(crate) async fn fetch_booking(&self, tenant: &str, id: &str) -> Result<BookingRequest> {
        let filter = Filter::new()
            .eq("id", id)
            .eq(TENANT_COLUMN, tenant)
            .limit(1);
        let row = self
            .gateway
            .query(BookingRequest::TABLE, &filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("booking", id))?;
        BookingRequest::from_row(row)
    }

    /// Patch one row, reporting any failure as a write error for `step`.
    pub(crate) async fn write(&self, table: &str, id: &str, patch: Row, step: &str) -> Result<()> {
        self.gateway
            .update(table, id, patch)
            .await
            .map_err(|e| self.write_error(step, e))
    }

    /// Insert one row, reporting any failure as a write error for `step`.
    pub(crate) async fn create(&self, table: &str, record: Row, step: &str) -> Result<Row> {
        self.gateway
            .insert(table, record)
            .await
            .map_err(|e| self.write_error(step, e))
    }

    fn write_error(&self, step: &str, error: Error) -> Error {
        self.metrics.record_write_error(step, &error.to_string());
        match error {
            Error::WriteError(msg) => Error::WriteError(format!("{}: {}", step, msg)),
            other => Error::WriteError(format!("{}: {}", step, other)),
        }
    }

    /// Apply a locally written booking to the cache without waiting for the echo.
    pub(crate) async fn apply_local(&self, booking: BookingRequest) {
        let (before, after) = {
            let mut cache = self.cache.write().await;
            let before = cache.pending_count();
            let outcome = cache.apply_update(booking);
            trace!("optimistic cache update: {:?}", outcome);
            (before, cache.pending_count())
        };
        if before != after {
            self.events.publish(BookingEvent::PendingCountChanged(after));
        }
    }

    /// Apply a change-feed event to the cache and announce it.
    pub(crate) async fn apply_change(&self, event: ChangeEvent) {
        let applied = {
            let mut cache = self.cache.write().await;
            let before = cache.pending_count();
            cache
                .apply(&event)
                .map(|outcome| (outcome, before, cache.pending_count()))
        };

        match applied {
            Ok((outcome, before, after)) => {
                debug!(
                    "change {:?} on {} {:?} -> {:?}",
                    event.kind,
                    event.table,
                    event.row_id(),
                    outcome
                );
                self.events.publish(BookingEvent::Changed(event));
                if before != after {
                    self.events.publish(BookingEvent::PendingCountChanged(after));
                }
            }
            Err(e) => warn!(
                "dropping undecodable change on {} {:?}: {}",
                event.table,
                event.row_id(),
                e
            ),
        }
    }
}

/// What is being done to a booking while its guard is held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Convert,
    Reconcile,
    Status(BookingStatus),
    Archive(bool),
    Reschedule(NaiveDate, String),
}

/// Marks a booking as being worked on; released on drop.
pub(crate) struct InFlight<'a> {
    map: &'a DashMap<String, Action>,
    id: String,
}

impl<'a> InFlight<'a> {
    /// # Errors
    ///
    /// Returns `Error::Conflict` if any operation holds `id`.
    pub(crate) fn acquire(
        map: &'a DashMap<String, Action>,
        id: &str,
        action: Action,
    ) -> Result<Self> {
        match map.entry(id.to_string()) {
            Entry::Occupied(running) => Err(busy(id, running.get())),
            Entry::Vacant(slot) => {
                slot.insert(action);
                Ok(InFlight {
                    map,
                    id: id.to_string(),
                })
            }
        }
    }

    /// Like [`InFlight::acquire`], but a repeat of the action already running
    /// on `id` yields `Ok(None)` instead of a conflict.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if a different operation holds `id`.
    pub(crate) fn join(
        map: &'a DashMap<String, Action>,
        id: &str,
        action: Action,
    ) -> Result<Option<Self>> {
        match map.entry(id.to_string()) {
            Entry::Occupied(running) if *running.get() == action => Ok(None),
            Entry::Occupied(running) => Err(busy(id, running.get())),
            Entry::Vacant(slot) => {
                slot.insert(action);
                Ok(Some(InFlight {
                    map,
                    id: id.to_string(),
                }))
            }
        }
    }
}

fn busy(id: &str, running: &Action) -> Error {
    Error::Conflict(format!(
        "booking {} is already being processed ({:?})",
        id, running
    ))
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

/// High-level booking service.
///
/// Cloning is cheap: clones share the gateway, cache and event bus.
///
/// # Example
///
/// ```no_run
/// use booking_sync::{BookingService, BookingConfig, Session, FetchStrategy};
/// use booking_sync::gateway::InMemoryStore;
/// use booking_sync::notify::NoOpNotifier;
///
/// #[tokio::main]
/// async fn main() -> booking_sync::Result<()> {
///     let service = BookingService::new(
///         InMemoryStore::new(),
///         NoOpNotifier,
///         Session::new("salon-1", "user-1"),
///         BookingConfig::default(),
///     );
///
///     let bookings = service.list_bookings(FetchStrategy::Merge).await?;
///     println!("{} bookings, {} pending", bookings.len(), service.pending_count().await);
///     Ok(())
/// }
/// ```
pub struct BookingService<G, N> {
    shared: Arc<Shared<G, N>>,
}

impl<G, N> Clone for BookingService<G, N> {
    fn clone(&self) -> Self {
        BookingService {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<G: StoreGateway, N: Notifier> BookingService<G, N> {
    /// Create a service showing active bookings.
    pub fn new(gateway: G, notifier: N, session: Session, config: BookingConfig) -> Self {
        Self::with_metrics(gateway, notifier, session, config, Arc::new(NoOpMetrics))
    }

    /// Create a service with custom metrics.
    pub fn with_metrics(
        gateway: G,
        notifier: N,
        session: Session,
        config: BookingConfig,
        metrics: Arc<dyn SyncMetrics>,
    ) -> Self {
        BookingService {
            shared: Arc::new(Shared {
                gateway,
                notifier,
                session,
                config,
                cache: RwLock::new(BookingCache::new(ViewFilter::active())),
                events: EventBus::new(),
                metrics,
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.shared.gateway
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    pub fn config(&self) -> &BookingConfig {
        &self.shared.config
    }

    /// Bus carrying status, conversion, connection and pending-count events.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Current view.
    pub async fn view(&self) -> ViewFilter {
        self.shared.cache.read().await.view()
    }

    /// Switch the visible set. The cache is cleared when the view changes;
    /// call [`BookingService::list_bookings`] to reload it.
    pub async fn set_view(&self, view: ViewFilter) {
        let mut cache = self.shared.cache.write().await;
        cache.set_view(view);
    }

    /// Number of pending bookings in the current view.
    pub async fn pending_count(&self) -> usize {
        self.shared.cache.read().await.pending_count()
    }

    /// Snapshot of the visible set without touching the store.
    pub async fn cached_bookings(&self) -> Vec<BookingRequest> {
        self.shared.cache.read().await.list().to_vec()
    }

    /// List the bookings of the session's tenant for the current view.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigurationError`: no tenant in the session
    /// - `Error::QueryError` / `Error::TransportError`: the store read failed
    /// - `Error::DecodeError`: a returned row is malformed
    pub async fn list_bookings(&self, strategy: FetchStrategy) -> Result<Vec<BookingRequest>> {
        if !strategy.reads_store() {
            return Ok(self.cached_bookings().await);
        }

        let tenant = self.shared.session.tenant()?;
        let view = self.view().await;
        let timer = Instant::now();

        let mut filter = Filter::new()
            .eq(TENANT_COLUMN, tenant)
            .eq("archived", view.archived)
            .order_desc("created_at");
        if let Some(status) = view.status {
            filter = filter.eq("status", status.as_str());
        }
        if let Some(limit) = self.shared.config.list_limit {
            filter = filter.limit(limit);
        }

        let rows = self.shared.gateway.query(BookingRequest::TABLE, &filter).await?;
        let fetched: Vec<BookingRequest> = decode_rows(rows)?;
        debug!(
            "Executing {} fetch for tenant {}: {} rows",
            strategy,
            tenant,
            fetched.len()
        );

        if strategy == FetchStrategy::Bypass {
            return Ok(fetched);
        }

        let count = fetched.len();
        let (list, before, after) = {
            let mut cache = self.shared.cache.write().await;
            let before = cache.pending_count();
            if strategy == FetchStrategy::Replace {
                cache.clear();
            }
            cache.replace_or_merge(fetched);
            (cache.list().to_vec(), before, cache.pending_count())
        };

        self.shared.metrics.record_merge(count, timer.elapsed());
        if before != after {
            self.shared
                .events
                .publish(BookingEvent::PendingCountChanged(after));
        }
        Ok(list)
    }

    /// Convert a pending booking into an appointment.
    ///
    /// See [`crate::workflow`] for the step sequence and failure semantics.
    pub async fn convert_to_appointment(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutcome> {
        workflow::convert(&self.shared, &request).await
    }

    /// Move a booking to `status`.
    ///
    /// Confirming a pending booking runs the conversion workflow with the
    /// booking's own staff and service.
    pub async fn set_status(&self, booking_id: &str, status: BookingStatus) -> Result<StatusOutcome> {
        lifecycle::set_status(&self.shared, booking_id, status).await
    }

    /// Archive or restore a booking.
    pub async fn set_archived(&self, booking_id: &str, archived: bool) -> Result<StatusOutcome> {
        lifecycle::set_archived(&self.shared, booking_id, archived).await
    }

    /// Change the requested date and time of a booking.
    pub async fn reschedule(
        &self,
        booking_id: &str,
        date: NaiveDate,
        time: &str,
    ) -> Result<StatusOutcome> {
        lifecycle::reschedule(&self.shared, booking_id, date, time).await
    }

    /// Finish conversions that created an appointment but never confirmed
    /// the booking.
    pub async fn reconcile_pending(&self) -> Result<ReconcileReport> {
        workflow::reconcile_pending(&self.shared).await
    }

    /// Subscribe to booking changes for the session's tenant.
    ///
    /// Each change is applied to the cache, announced on the event bus and
    /// then passed to `on_change`. The returned manager owns the subscription;
    /// dropping it (or calling [`RealtimeManager::shutdown`]) closes it.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if the session has no tenant.
    pub async fn subscribe_to_changes<F>(&self, on_change: F) -> Result<RealtimeManager<G>>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let tenant = self.shared.session.tenant()?.to_string();
        let shared = Arc::clone(&self.shared);
        let on_change = Arc::new(on_change);

        let handler = change_handler(move |event: ChangeEvent| {
            let shared = Arc::clone(&shared);
            let on_change = Arc::clone(&on_change);
            async move {
                shared.apply_change(event.clone()).await;
                on_change(event);
            }
        });

        let manager = RealtimeManager::builder(
            self.shared.gateway.clone(),
            SubscriptionTarget::new(BookingRequest::TABLE, TENANT_COLUMN, tenant),
            handler,
        )
        .config(self.shared.config.realtime.clone())
        .events(self.shared.events.clone())
        .metrics(Arc::clone(&self.shared.metrics))
        .build();

        manager.start().await;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryStore;
    use crate::notify::NoOpNotifier;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.seed(
            "online_bookings",
            vec![
                row(json!({
                    "id": "b1", "salon_id": "salon-1", "customer_name": "Anna",
                    "requested_date": "2024-05-01", "requested_time": "10:00",
                    "status": "pending", "archived": false,
                    "created_at": "2024-04-01T08:00:00Z"
                })),
                row(json!({
                    "id": "b2", "salon_id": "salon-1", "customer_name": "Bea",
                    "requested_date": "2024-05-02", "requested_time": "11:00",
                    "status": "confirmed", "archived": true,
                    "created_at": "2024-04-02T08:00:00Z"
                })),
                row(json!({
                    "id": "b3", "salon_id": "salon-2", "customer_name": "Other",
                    "requested_date": "2024-05-02", "requested_time": "11:00",
                    "status": "pending", "archived": false,
                    "created_at": "2024-04-03T08:00:00Z"
                })),
            ],
        );
        store
    }

    fn service(store: InMemoryStore) -> BookingService<InMemoryStore, NoOpNotifier> {
        BookingService::new(
            store,
            NoOpNotifier,
            Session::new("salon-1", "user-1"),
            BookingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_list_is_tenant_scoped_and_view_filtered() {
        let service = service(seeded_store());

        let active = service
            .list_bookings(FetchStrategy::Merge)
            .await
            .expect("Failed to list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b1");
        assert_eq!(service.pending_count().await, 1);

        service.set_view(ViewFilter::archived()).await;
        assert!(service.cached_bookings().await.is_empty());

        let archived = service
            .list_bookings(FetchStrategy::Replace)
            .await
            .expect("Failed to list");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, "b2");
        assert_eq!(service.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_bypass_leaves_cache_alone() {
        let service = service(seeded_store());

        let rows = service
            .list_bookings(FetchStrategy::Bypass)
            .await
            .expect("Failed to list");
        assert_eq!(rows.len(), 1);
        assert!(service.cached_bookings().await.is_empty());

        let cached = service
            .list_bookings(FetchStrategy::Cached)
            .await
            .expect("Failed to list");
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_list_without_tenant_fails() {
        let service = BookingService::new(
            seeded_store(),
            NoOpNotifier,
            Session::default(),
            BookingConfig::default(),
        );
        let result = service.list_bookings(FetchStrategy::Merge).await;
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_in_flight_guard() {
        let map = DashMap::new();
        let guard = InFlight::acquire(&map, "b1", Action::Convert).expect("Failed to acquire");
        assert!(matches!(
            InFlight::acquire(&map, "b1", Action::Convert),
            Err(Error::Conflict(_))
        ));
        drop(guard);
        assert!(InFlight::acquire(&map, "b1", Action::Convert).is_ok());
    }

    #[test]
    fn test_in_flight_join_same_action() {
        let map = DashMap::new();
        let guard = InFlight::join(&map, "b1", Action::Archive(true))
            .expect("Failed to join")
            .expect("Failed to acquire");

        assert!(InFlight::join(&map, "b1", Action::Archive(true))
            .expect("Failed to join")
            .is_none());
        assert!(matches!(
            InFlight::join(&map, "b1", Action::Archive(false)),
            Err(Error::Conflict(_))
        ));

        drop(guard);
        assert!(map.is_empty());
    }

    /// A second click on the same action while the first still holds the
    /// booking reports success without touching the store.
    #[tokio::test]
    async fn test_repeated_action_in_flight_is_unchanged() {
        let store = seeded_store();
        let service = service(store.clone());
        let running = InFlight::acquire(
            &service.shared.in_flight,
            "b1",
            Action::Status(BookingStatus::Cancelled),
        )
        .expect("Failed to acquire");

        let outcome = service
            .set_status("b1", BookingStatus::Cancelled)
            .await
            .expect("Failed to set status");
        assert_eq!(outcome, StatusOutcome::Unchanged);
        assert_eq!(store.calls(crate::gateway::StoreOp::Update, "online_bookings"), 0);

        let other = service.set_archived("b1", true).await;
        assert!(matches!(other, Err(Error::Conflict(_))));

        drop(running);
        let outcome = service
            .set_status("b1", BookingStatus::Cancelled)
            .await
            .expect("Failed to set status");
        assert_eq!(outcome, StatusOutcome::Updated);
    }

    #[test]
    fn test_service_clone_shares_state() {
        let service = service(InMemoryStore::new());
        let clone = service.clone();
        assert!(Arc::ptr_eq(&service.shared, &clone.shared));
    }
}
