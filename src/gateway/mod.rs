//! Store gateway: the generic query/write/change-feed interface to the hosted store.

use crate::entity::Row;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

pub mod filter;
#[cfg(feature = "inmemory")]
pub mod inmemory;

pub use filter::{Clause, Direction, Filter};
#[cfg(feature = "inmemory")]
pub use inmemory::{InMemoryStore, StoreOp};

/// Kind of row-level change delivered by the change feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification.
///
/// For deletes `row` carries the last known version of the deleted row
/// (at minimum its `id`).
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Row,
}

impl ChangeEvent {
    /// Identity of the changed row, if present.
    pub fn row_id(&self) -> Option<&str> {
        self.row.get("id").and_then(|v| v.as_str())
    }
}

/// Channel-level status reported by the change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The subscription is live.
    Subscribed,
    /// The channel failed (`CHANNEL_ERROR`).
    ChannelError(String),
    /// The subscription handshake timed out (`TIMED_OUT`).
    TimedOut,
    /// The channel was closed.
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Subscribed => write!(f, "SUBSCRIBED"),
            ChannelStatus::ChannelError(msg) => write!(f, "CHANNEL_ERROR ({})", msg),
            ChannelStatus::TimedOut => write!(f, "TIMED_OUT"),
            ChannelStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Message delivered on a subscription's receiver.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

/// Opaque identifier of an open subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// An open change-feed subscription.
///
/// Messages arrive on `messages`. The receiver ends when the gateway closes
/// the channel.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// Trait for hosted-store gateway implementations.
///
/// Each write is independent: no transaction or batch atomicity is assumed, so
/// callers must treat multi-step writes as a best-effort sequence.
///
/// All methods use `&self`; implementations use interior mutability or an
/// external connection. Futures are `Send` so callers can drive them from
/// spawned tasks.
pub trait StoreGateway: Send + Sync + Clone + 'static {
    /// Query rows of `table` matching `filter`.
    ///
    /// # Errors
    /// Returns `Error::QueryError` or `Error::TransportError`.
    fn query(&self, table: &str, filter: &Filter) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Insert `record` into `table` and return the stored row (with its id).
    ///
    /// # Errors
    /// Returns `Error::WriteError` (constraint, permission) or `Error::TransportError`.
    fn insert(&self, table: &str, record: Row) -> impl Future<Output = Result<Row>> + Send;

    /// Merge `patch` into the row `id` of `table`.
    ///
    /// # Errors
    /// Returns `Error::WriteError`, `Error::NotFound` or `Error::TransportError`.
    fn update(&self, table: &str, id: &str, patch: Row) -> impl Future<Output = Result<()>> + Send;

    /// Delete row `id` from `table`.
    ///
    /// # Errors
    /// Returns `Error::WriteError` or `Error::TransportError`.
    fn delete(&self, table: &str, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Open a change feed on `table`, restricted to rows whose `tenant_column`
    /// equals `tenant_id`.
    ///
    /// # Errors
    /// Returns `Error::TransportError` if the channel cannot be opened at all.
    fn subscribe(
        &self,
        table: &str,
        tenant_column: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Close a subscription. Unknown handles are ignored.
    ///
    /// # Errors
    /// Returns `Error::TransportError` if the close request cannot be sent.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> impl Future<Output = Result<()>> + Send;

    /// Health check - verify the store is reachable.
    ///
    /// # Errors
    /// Returns `Err` if the store is not accessible
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}
