//! Conversion of a booking request into an appointment.
//!
//! The conversion is a sequence of independent store writes with no
//! transaction around them:
//!
//! 1. resolve the tenant and the acting user
//! 2. load the booking (a booking already `confirmed` is a no-op)
//! 3. load the service (duration and price)
//! 4. compute the appointment window
//! 5. reuse the appointment already linked to the booking, if any
//! 6. otherwise find the customer by email or phone (or create one) and
//!    create the appointment
//! 7. create the service line item (or reuse it)
//! 8. mark the booking `confirmed`
//! 9. update the local cache
//! 10. send the confirmation email, best effort
//!
//! A failure stops the sequence and is returned; earlier writes stay. Because
//! steps 5 and 7 look up what a previous attempt already wrote, running the
//! conversion again after a partial failure finishes it without duplicating
//! rows. [`reconcile_pending`] does the same in bulk for bookings whose
//! appointment exists but whose status write never landed.

use crate::entity::{encode_row, Record, Row};
use crate::error::{Error, Result};
use crate::events::BookingEvent;
use crate::gateway::{Filter, StoreGateway};
use crate::models::{
    Appointment, AppointmentStatus, BookingRequest, BookingStatus, Customer, NewAppointment,
    NewCustomer, NewServiceLineItem, SalonService, ServiceLineItem, TENANT_COLUMN,
};
use crate::notify::{send_best_effort, EmailKind, Notifier};
use crate::schedule::appointment_window;
use crate::service::{Action, InFlight, Shared};
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;

/// Input to [`crate::BookingService::convert_to_appointment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionRequest {
    pub booking_id: String,
    /// Staff member who will deliver the service.
    pub staff_id: String,
    pub service_id: String,
}

impl ConversionRequest {
    pub fn new(
        booking_id: impl Into<String>,
        staff_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        ConversionRequest {
            booking_id: booking_id.into(),
            staff_id: staff_id.into(),
            service_id: service_id.into(),
        }
    }
}

/// Result of a conversion.
#[derive(Clone, Debug, PartialEq)]
pub enum ConversionOutcome {
    /// The booking was already confirmed; nothing was written.
    AlreadyConfirmed,
    /// The booking is now confirmed and linked to an appointment.
    Converted {
        appointment_id: String,
        customer_id: String,
        line_item_id: String,
        /// Whether this run found an appointment left by an earlier attempt.
        resumed: bool,
        /// Whether the confirmation email was accepted.
        email_sent: bool,
    },
}

impl ConversionOutcome {
    pub fn appointment_id(&self) -> Option<&str> {
        match self {
            ConversionOutcome::Converted { appointment_id, .. } => Some(appointment_id.as_str()),
            ConversionOutcome::AlreadyConfirmed => None,
        }
    }
}

/// Summary of a [`reconcile_pending`] sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    /// Pending bookings inspected.
    pub scanned: usize,
    /// Bookings moved to `confirmed` because their appointment already existed.
    pub repaired: Vec<String>,
    /// Missing line items that were added along the way.
    pub line_items_added: usize,
    /// Bookings that could not be repaired, with the reason.
    pub failed: Vec<(String, Error)>,
}

/// Run the conversion workflow.
pub(crate) async fn convert<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    request: &ConversionRequest,
) -> Result<ConversionOutcome> {
    shared.session.tenant()?;
    shared.session.actor()?;
    validate_request(request)?;

    let _guard = InFlight::acquire(&shared.in_flight, &request.booking_id, Action::Convert)?;
    convert_held(shared, request).await
}

/// Conversion body. The caller holds the booking's in-flight guard.
pub(crate) async fn convert_held<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    request: &ConversionRequest,
) -> Result<ConversionOutcome> {
    let timer = Instant::now();
    let tenant = shared.session.tenant()?;
    let actor = shared.session.actor()?;

    let booking = shared.fetch_booking(tenant, &request.booking_id).await?;
    match booking.status {
        BookingStatus::Confirmed => {
            info!("booking {} already confirmed, skipping conversion", booking.id);
            return Ok(ConversionOutcome::AlreadyConfirmed);
        }
        BookingStatus::Pending => {}
        other => {
            return Err(Error::InvalidTransition {
                from: other.to_string(),
                to: BookingStatus::Confirmed.to_string(),
            })
        }
    }

    let service = fetch_service(shared, tenant, &request.service_id).await?;
    let window = appointment_window(&booking.requested_time, service.duration)?;
    if window.crosses_midnight {
        warn!(
            "booking {}: appointment {}-{} runs past midnight, keeping date {}",
            booking.id,
            window.start, window.end, booking.requested_date
        );
    }

    // An existing appointment already names its customer; resolving again
    // could insert a second one for bookings without contact details.
    let existing = find_appointment(shared, tenant, &booking.id).await?;
    let (appointment_id, customer_id, resumed) = match existing {
        Some(existing) => {
            info!(
                "booking {}: resuming conversion with existing appointment {}",
                booking.id, existing.id
            );
            (existing.id, existing.customer_id, true)
        }
        None => {
            let customer = resolve_customer(shared, tenant, &booking).await?;
            let new_appointment = NewAppointment {
                tenant_id: tenant.to_string(),
                customer_id: customer.id.clone(),
                staff_id: request.staff_id.clone(),
                date: booking.requested_date,
                start_time: window.start.clone(),
                end_time: window.end.clone(),
                price: service.price,
                note: appointment_note(&booking),
                status: AppointmentStatus::Scheduled,
                booking_id: booking.id.clone(),
                created_by: actor.to_string(),
                created_at: Utc::now(),
            };
            let stored = shared
                .create(Appointment::TABLE, encode_row(&new_appointment)?, "create appointment")
                .await?;
            (stored_id(&stored, Appointment::TABLE)?, customer.id, false)
        }
    };

    let line_item_id = ensure_line_item(shared, &appointment_id, &service).await?;

    let confirmed = mark_confirmed(shared, booking).await?;

    shared.events.publish(BookingEvent::Converted {
        booking_id: confirmed.id.clone(),
        appointment_id: appointment_id.clone(),
    });

    let email_sent = send_best_effort(
        &shared.notifier,
        shared.config.notifications_enabled,
        EmailKind::Confirmation,
        &confirmed,
    )
    .await;

    shared.metrics.record_conversion(&confirmed.id, timer.elapsed());
    info!(
        "✓ booking {} converted to appointment {} in {:?}",
        confirmed.id,
        appointment_id,
        timer.elapsed()
    );

    Ok(ConversionOutcome::Converted {
        appointment_id,
        customer_id,
        line_item_id,
        resumed,
        email_sent,
    })
}

/// Confirm every pending booking that already has an appointment.
///
/// Covers conversions that stopped after step 6 or 7. Bookings without an
/// appointment are left pending. A failure on one booking is recorded in the
/// report and the sweep moves on.
pub(crate) async fn reconcile_pending<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
) -> Result<ReconcileReport> {
    let tenant = shared.session.tenant()?;
    let filter = Filter::new()
        .eq(TENANT_COLUMN, tenant)
        .eq("status", BookingStatus::Pending.as_str());
    let rows = shared.gateway.query(BookingRequest::TABLE, &filter).await?;

    let mut report = ReconcileReport {
        scanned: rows.len(),
        ..Default::default()
    };

    for row in rows {
        let booking = match BookingRequest::from_row(row) {
            Ok(b) => b,
            Err(e) => {
                warn!("reconcile: skipping undecodable booking: {}", e);
                continue;
            }
        };
        let id = booking.id.clone();

        let guard = match InFlight::acquire(&shared.in_flight, &id, Action::Reconcile) {
            Ok(guard) => guard,
            Err(e) => {
                debug!("reconcile: {} busy, skipping", id);
                report.failed.push((id, e));
                continue;
            }
        };

        match repair(shared, tenant, booking).await {
            Ok(Some(added)) => {
                if added {
                    report.line_items_added += 1;
                }
                report.repaired.push(id);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("reconcile: booking {} not repaired: {}", id, e);
                report.failed.push((id, e));
            }
        }
        drop(guard);
    }

    info!(
        "reconcile: {} pending scanned, {} repaired, {} failed",
        report.scanned,
        report.repaired.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Finish one stalled conversion. Returns `None` if nothing was converted yet,
/// otherwise whether a line item had to be added.
async fn repair<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    tenant: &str,
    booking: BookingRequest,
) -> Result<Option<bool>> {
    let appointment = match find_appointment(shared, tenant, &booking.id).await? {
        Some(a) => a,
        None => return Ok(None),
    };

    let mut added = false;
    let items = shared
        .gateway
        .query(
            ServiceLineItem::TABLE,
            &Filter::new().eq("order_id", appointment.id.as_str()),
        )
        .await?;
    if items.is_empty() {
        if let Some(service_id) = booking.service_id.as_deref() {
            let service = fetch_service(shared, tenant, service_id).await?;
            ensure_line_item(shared, &appointment.id, &service).await?;
            added = true;
        }
    }

    let confirmed = mark_confirmed(shared, booking).await?;
    shared.events.publish(BookingEvent::Converted {
        booking_id: confirmed.id.clone(),
        appointment_id: appointment.id.clone(),
    });
    send_best_effort(
        &shared.notifier,
        shared.config.notifications_enabled,
        EmailKind::Confirmation,
        &confirmed,
    )
    .await;
    Ok(Some(added))
}

fn validate_request(request: &ConversionRequest) -> Result<()> {
    let missing = [
        ("booking_id", &request.booking_id),
        ("staff_id", &request.staff_id),
        ("service_id", &request.service_id),
    ]
    .into_iter()
    .find(|(_, v)| v.trim().is_empty());

    match missing {
        Some((field, _)) => Err(Error::ValidationError(format!("{} is required", field))),
        None => Ok(()),
    }
}

async fn fetch_service<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    tenant: &str,
    service_id: &str,
) -> Result<SalonService> {
    let filter = Filter::new()
        .eq("id", service_id)
        .eq(TENANT_COLUMN, tenant)
        .limit(1);
    let row = shared
        .gateway
        .query(SalonService::TABLE, &filter)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found("service", service_id))?;
    SalonService::from_row(row)
}

/// Match an existing customer by email or phone, otherwise create one.
async fn resolve_customer<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    tenant: &str,
    booking: &BookingRequest,
) -> Result<Customer> {
    let mut contacts: Vec<(String, Value)> = Vec::new();
    if let Some(email) = &booking.customer_email {
        contacts.push(("email".to_string(), Value::from(email.as_str())));
    }
    if let Some(phone) = &booking.customer_phone {
        contacts.push(("phone".to_string(), Value::from(phone.as_str())));
    }

    if !contacts.is_empty() {
        let filter = Filter::new()
            .eq(TENANT_COLUMN, tenant)
            .any_of(contacts)
            .limit(1);
        let found = shared.gateway.query(Customer::TABLE, &filter).await?;
        if let Some(row) = found.into_iter().next() {
            let customer = Customer::from_row(row)?;
            debug!("booking {}: matched customer {}", booking.id, customer.id);
            return Ok(customer);
        }
    }

    let new_customer = NewCustomer {
        tenant_id: tenant.to_string(),
        name: booking.customer_name.clone(),
        email: booking.customer_email.clone(),
        phone: booking.customer_phone.clone(),
        note: format!("Created from online booking {}", booking.id),
    };
    let stored = shared
        .create(Customer::TABLE, encode_row(&new_customer)?, "create customer")
        .await?;
    let customer = Customer::from_row(stored)?;
    debug!("booking {}: created customer {}", booking.id, customer.id);
    Ok(customer)
}

async fn find_appointment<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    tenant: &str,
    booking_id: &str,
) -> Result<Option<Appointment>> {
    let filter = Filter::new()
        .eq(TENANT_COLUMN, tenant)
        .eq("booking_id", booking_id)
        .limit(1);
    shared
        .gateway
        .query(Appointment::TABLE, &filter)
        .await?
        .into_iter()
        .next()
        .map(Appointment::from_row)
        .transpose()
}

async fn ensure_line_item<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    appointment_id: &str,
    service: &SalonService,
) -> Result<String> {
    let filter = Filter::new()
        .eq("order_id", appointment_id)
        .eq("service_id", service.id.as_str())
        .limit(1);
    if let Some(row) = shared
        .gateway
        .query(ServiceLineItem::TABLE, &filter)
        .await?
        .into_iter()
        .next()
    {
        return stored_id(&row, ServiceLineItem::TABLE);
    }

    let item = NewServiceLineItem {
        appointment_id: appointment_id.to_string(),
        service_id: service.id.clone(),
        service_name: service.name.clone(),
        price: service.price,
    };
    let stored = shared
        .create(ServiceLineItem::TABLE, encode_row(&item)?, "create line item")
        .await?;
    stored_id(&stored, ServiceLineItem::TABLE)
}

/// Write `confirmed`, then mirror it into the cache.
async fn mark_confirmed<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    mut booking: BookingRequest,
) -> Result<BookingRequest> {
    let now = Utc::now();
    let mut patch = Row::new();
    patch.insert(
        "status".to_string(),
        Value::from(BookingStatus::Confirmed.as_str()),
    );
    patch.insert("updated_at".to_string(), Value::from(now.to_rfc3339()));
    shared
        .write(BookingRequest::TABLE, &booking.id, patch, "confirm booking")
        .await?;

    booking.status = BookingStatus::Confirmed;
    booking.updated_at = Some(now);
    shared.apply_local(booking.clone()).await;
    shared.events.publish(BookingEvent::StatusChanged {
        booking_id: booking.id.clone(),
        status: BookingStatus::Confirmed,
    });
    Ok(booking)
}

fn appointment_note(booking: &BookingRequest) -> String {
    if booking.notes.trim().is_empty() {
        format!("Online booking {}", booking.id)
    } else {
        format!("Online booking {}: {}", booking.id, booking.notes.trim())
    }
}

fn stored_id(row: &Row, table: &str) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::DecodeError(format!("{} row returned without id", table)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn booking(notes: &str) -> BookingRequest {
        BookingRequest {
            id: "b1".to_string(),
            tenant_id: "salon-1".to_string(),
            customer_name: "Anna".to_string(),
            customer_email: None,
            customer_phone: None,
            requested_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            requested_time: "14:00".to_string(),
            service_id: None,
            service_name: None,
            service_duration: None,
            service_price: None,
            staff_id: None,
            notes: notes.to_string(),
            status: BookingStatus::Pending,
            archived: false,
            created_at: Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap(),
            updated_at: None,
        }
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&ConversionRequest::new("b1", "t1", "s1")).is_ok());
        match validate_request(&ConversionRequest::new("b1", " ", "s1")) {
            Err(Error::ValidationError(msg)) => assert!(msg.contains("staff_id")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_appointment_note_references_booking() {
        assert_eq!(appointment_note(&booking("")), "Online booking b1");
        assert_eq!(
            appointment_note(&booking(" window seat ")),
            "Online booking b1: window seat"
        );
    }

    #[test]
    fn test_stored_id() {
        let mut row = Row::new();
        assert!(matches!(stored_id(&row, "orders"), Err(Error::DecodeError(_))));
        row.insert("id".to_string(), Value::from("o1"));
        assert_eq!(stored_id(&row, "orders").unwrap(), "o1");
    }

    #[test]
    fn test_outcome_appointment_id() {
        assert_eq!(ConversionOutcome::AlreadyConfirmed.appointment_id(), None);
        let converted = ConversionOutcome::Converted {
            appointment_id: "o1".to_string(),
            customer_id: "c1".to_string(),
            line_item_id: "l1".to_string(),
            resumed: false,
            email_sent: false,
        };
        assert_eq!(converted.appointment_id(), Some("o1"));
    }
}
