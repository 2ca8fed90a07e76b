//! In-memory store gateway (default, thread-safe, async).
//!
//! Uses DashMap for per-table sharding. Rows keep insertion order, writes are
//! broadcast to matching change-feed subscribers, and failures can be injected
//! per operation for exercising partial-failure paths.

use super::{
    ChangeEvent, ChangeKind, ChannelMessage, ChannelStatus, Filter, StoreGateway, Subscription,
    SubscriptionHandle,
};
use crate::entity::Row;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Store operation, used for failure injection and call counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Query,
    Insert,
    Update,
    Delete,
    Subscribe,
}

struct Subscriber {
    table: String,
    tenant_column: String,
    tenant_id: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl Subscriber {
    fn wants(&self, table: &str, row: &Row) -> bool {
        self.table == table
            && row.get(&self.tenant_column).and_then(Value::as_str) == Some(self.tenant_id.as_str())
    }
}

#[derive(Default)]
struct StoreInner {
    tables: DashMap<String, Vec<Row>>,
    unique: DashMap<String, Vec<String>>,
    failures: DashMap<(StoreOp, String), u32>,
    calls: DashMap<(StoreOp, String), u64>,
    subscribers: DashMap<u64, Subscriber>,
    next_handle: AtomicU64,
    offline: AtomicBool,
    rejected_subscriptions: AtomicU32,
}

/// Thread-safe in-memory store gateway.
///
/// Cloning is cheap; clones share the same tables and subscribers.
///
/// # Example
///
/// ```no_run
/// use booking_sync::gateway::{Filter, InMemoryStore, StoreGateway};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new().with_unique_constraint("orders", "booking_id");
///
///     let row = json!({"salon_id": "salon-1", "booking_id": "b1"});
///     let stored = store.insert("orders", row.as_object().cloned().unwrap()).await?;
///     assert!(stored.contains_key("id"));
///
///     let rows = store.query("orders", &Filter::new().eq("booking_id", "b1")).await?;
///     assert_eq!(rows.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inserts that repeat a non-null value of `field` within `table`.
    pub fn with_unique_constraint(self, table: &str, field: &str) -> Self {
        self.inner
            .unique
            .entry(table.to_string())
            .or_default()
            .push(field.to_string());
        self
    }

    /// Load rows directly, bypassing change notifications.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut stored = self.inner.tables.entry(table.to_string()).or_default();
        for mut row in rows {
            ensure_id(&mut row);
            stored.push(row);
        }
    }

    /// Snapshot of every row in `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Look up one row by id.
    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.inner
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| row_id(r) == Some(id)).cloned())
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.inner.tables.get(table).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of `op` calls made against `table`, including failed ones.
    pub fn calls(&self, op: StoreOp, table: &str) -> u64 {
        self.inner
            .calls
            .get(&(op, table.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Make the next `op` against `table` fail.
    pub fn fail_next(&self, op: StoreOp, table: &str) {
        *self
            .inner
            .failures
            .entry((op, table.to_string()))
            .or_insert(0) += 1;
    }

    /// Simulate loss of connectivity: every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` subscriptions report `CHANNEL_ERROR` instead of `SUBSCRIBED`.
    pub fn fail_subscriptions(&self, count: u32) {
        self.inner
            .rejected_subscriptions
            .store(count, Ordering::SeqCst);
    }

    /// Push a channel status to every live subscriber.
    pub fn emit_status(&self, status: ChannelStatus) {
        for sub in self.inner.subscribers.iter() {
            let _ = sub.tx.send(ChannelMessage::Status(status.clone()));
        }
        debug!("✓ InMemory STATUS {} broadcast", status);
    }

    /// Number of currently open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::TransportError("store unreachable".to_string()));
        }
        Ok(())
    }

    fn record_call(&self, op: StoreOp, table: &str) {
        *self.inner.calls.entry((op, table.to_string())).or_insert(0) += 1;
    }

    fn take_failure(&self, op: StoreOp, table: &str) -> bool {
        if let Some(mut remaining) = self.inner.failures.get_mut(&(op, table.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn publish(&self, table: &str, kind: ChangeKind, row: &Row) {
        let mut closed = Vec::new();
        for sub in self.inner.subscribers.iter() {
            if !sub.wants(table, row) {
                continue;
            }
            let event = ChangeEvent {
                table: table.to_string(),
                kind,
                row: row.clone(),
            };
            if sub.tx.send(ChannelMessage::Change(event)).is_err() {
                closed.push(*sub.key());
            }
        }
        for key in closed {
            self.inner.subscribers.remove(&key);
        }
    }
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn ensure_id(row: &mut Row) {
    if row_id(row).is_none() {
        row.insert("id".to_string(), Value::String(Uuid::now_v7().to_string()));
    }
}

impl StoreGateway for InMemoryStore {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        self.check_online()?;
        self.record_call(StoreOp::Query, table);
        if self.take_failure(StoreOp::Query, table) {
            return Err(Error::QueryError(format!("injected failure on {}", table)));
        }

        let rows = filter.apply(self.rows(table));
        debug!("✓ InMemory QUERY {} -> {} rows", table, rows.len());
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut record: Row) -> Result<Row> {
        self.check_online()?;
        self.record_call(StoreOp::Insert, table);
        if self.take_failure(StoreOp::Insert, table) {
            return Err(Error::WriteError(format!("injected failure on {}", table)));
        }

        ensure_id(&mut record);
        let unique_fields = self
            .inner
            .unique
            .get(table)
            .map(|f| f.clone())
            .unwrap_or_default();

        {
            let mut rows = self.inner.tables.entry(table.to_string()).or_default();
            let id = row_id(&record).map(str::to_string);
            if rows.iter().any(|r| row_id(r).map(str::to_string) == id) {
                return Err(Error::WriteError(format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                )));
            }
            for field in &unique_fields {
                let value = match record.get(field) {
                    None | Some(Value::Null) => continue,
                    Some(v) => v,
                };
                if rows.iter().any(|r| r.get(field) == Some(value)) {
                    return Err(Error::WriteError(format!(
                        "duplicate key value violates unique constraint \"{}_{}_key\"",
                        table, field
                    )));
                }
            }
            rows.push(record.clone());
        }

        debug!("✓ InMemory INSERT {} {:?}", table, row_id(&record));
        self.publish(table, ChangeKind::Insert, &record);
        Ok(record)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<()> {
        self.check_online()?;
        self.record_call(StoreOp::Update, table);
        if self.take_failure(StoreOp::Update, table) {
            return Err(Error::WriteError(format!("injected failure on {}", table)));
        }

        let updated = {
            let mut rows = match self.inner.tables.get_mut(table) {
                Some(rows) => rows,
                None => return Err(Error::not_found(table, id)),
            };
            let row = rows
                .iter_mut()
                .find(|r| row_id(r) == Some(id))
                .ok_or_else(|| Error::not_found(table, id))?;
            for (key, value) in patch {
                if key != "id" {
                    row.insert(key, value);
                }
            }
            row.clone()
        };

        debug!("✓ InMemory UPDATE {} {}", table, id);
        self.publish(table, ChangeKind::Update, &updated);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.check_online()?;
        self.record_call(StoreOp::Delete, table);
        if self.take_failure(StoreOp::Delete, table) {
            return Err(Error::WriteError(format!("injected failure on {}", table)));
        }

        let removed = self.inner.tables.get_mut(table).and_then(|mut rows| {
            let pos = rows.iter().position(|r| row_id(r) == Some(id))?;
            Some(rows.remove(pos))
        });

        if let Some(row) = removed {
            debug!("✓ InMemory DELETE {} {}", table, id);
            self.publish(table, ChangeKind::Delete, &row);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        table: &str,
        tenant_column: &str,
        tenant_id: &str,
    ) -> Result<Subscription> {
        self.check_online()?;
        self.record_call(StoreOp::Subscribe, table);
        if self.take_failure(StoreOp::Subscribe, table) {
            return Err(Error::TransportError(format!(
                "injected failure subscribing to {}",
                table
            )));
        }

        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = mpsc::unbounded_channel();

        let rejected = self
            .inner
            .rejected_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let status = if rejected {
            ChannelStatus::ChannelError("subscription rejected".to_string())
        } else {
            ChannelStatus::Subscribed
        };
        let _ = tx.send(ChannelMessage::Status(status));

        self.inner.subscribers.insert(
            handle.0,
            Subscriber {
                table: table.to_string(),
                tenant_column: tenant_column.to_string(),
                tenant_id: tenant_id.to_string(),
                tx,
            },
        );

        debug!("✓ InMemory SUBSCRIBE {} ({}={}) -> {:?}", table, tenant_column, tenant_id, handle);
        Ok(Subscription {
            handle,
            messages: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some((_, sub)) = self.inner.subscribers.remove(&handle.0) {
            let _ = sub.tx.send(ChannelMessage::Status(ChannelStatus::Closed));
            debug!("✓ InMemory UNSUBSCRIBE {:?}", handle);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.inner.offline.load(Ordering::SeqCst))
    }
}
