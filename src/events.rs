//! Typed event bus shared by the service, the cache and the realtime manager.
//!
//! Hosts subscribe to [`BookingEvent`]s to refresh badges, lists and connection
//! indicators instead of listening for global window events.

use crate::gateway::ChangeEvent;
use crate::models::BookingStatus;
use crate::realtime::ConnectionStatus;
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Events published by the booking subsystem.
#[derive(Clone, Debug, PartialEq)]
pub enum BookingEvent {
    /// A change-feed event was applied to the local cache.
    Changed(ChangeEvent),
    /// A booking's status was written.
    StatusChanged {
        booking_id: String,
        status: BookingStatus,
    },
    /// A booking was archived or restored.
    ArchiveChanged { booking_id: String, archived: bool },
    /// A booking's requested date/time was edited.
    Rescheduled { booking_id: String },
    /// A booking was converted into an appointment.
    Converted {
        booking_id: String,
        appointment_id: String,
    },
    /// Realtime connection status changed.
    ConnectionChanged(ConnectionStatus),
    /// A realtime reconnect was scheduled after a failure.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Number of pending bookings in the current view changed.
    PendingCountChanged(usize),
}

/// Broadcast bus for [`BookingEvent`]s.
///
/// Cloning is cheap; clones publish to the same subscribers. Publishing with
/// no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<BookingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus that buffers up to `capacity` events per lagging subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: BookingEvent) {
        trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
