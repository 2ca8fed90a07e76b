//! # booking-sync
//!
//! Online-booking reconciliation and realtime synchronization for salon
//! management backends.
//!
//! ## Features
//!
//! - **Conversion:** Turn a pending booking request into an appointment, a
//!   matched or new customer and a service line item, resumably
//! - **Local cache:** Deduplicated, newest-wins view of booking requests fed by
//!   refetches and change-feed events
//! - **Lifecycle:** Status, archive and reschedule actions with idempotent
//!   no-ops and best-effort customer emails
//! - **Realtime:** Tenant-scoped subscription with exponential backoff,
//!   heartbeat liveness checks and visibility/network triggers
//! - **Store agnostic:** Works with any backend implementing [`StoreGateway`];
//!   an in-memory gateway is included
//!
//! ## Quick Start
//!
//! ```ignore
//! use booking_sync::{
//!     BookingConfig, BookingService, ConversionRequest, FetchStrategy, Session,
//!     gateway::InMemoryStore,
//!     notify::NoOpNotifier,
//! };
//!
//! let service = BookingService::new(
//!     InMemoryStore::new(),
//!     NoOpNotifier,
//!     Session::new("salon-1", "user-1"),
//!     BookingConfig::from_env(),
//! );
//!
//! // Load the active view and keep it live.
//! let bookings = service.list_bookings(FetchStrategy::Merge).await?;
//! let realtime = service.subscribe_to_changes(|event| println!("{:?}", event.kind)).await?;
//!
//! // Staff accept a request.
//! service
//!     .convert_to_appointment(ConversionRequest::new("b1", "staff-7", "svc-3"))
//!     .await?;
//!
//! realtime.shutdown().await;
//! ```

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod observability;
pub mod realtime;
pub mod schedule;
pub mod service;
pub mod strategy;
pub mod workflow;

// Re-exports for convenience
pub use cache::{BookingCache, ViewFilter};
pub use config::{BookingConfig, RealtimeConfig, Session};
pub use entity::Record;
pub use error::{Error, Result};
pub use events::{BookingEvent, EventBus};
pub use gateway::StoreGateway;
pub use lifecycle::StatusOutcome;
pub use models::{BookingRequest, BookingStatus};
pub use realtime::{ConnectionStatus, RealtimeManager};
pub use service::BookingService;
pub use strategy::FetchStrategy;
pub use workflow::{ConversionOutcome, ConversionRequest, ReconcileReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
