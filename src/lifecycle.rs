//! Status, archive and reschedule actions on booking requests.
//!
//! Every action holds the booking's in-flight guard while it reads and writes
//! the row. A request for the state the booking is already in is a no-op, and
//! so is a repeat of the same action while the first is still running. Double
//! clicks therefore never write twice or send a second email.

use crate::entity::{Record, Row};
use crate::error::{Error, Result};
use crate::events::BookingEvent;
use crate::gateway::StoreGateway;
use crate::models::{BookingRequest, BookingStatus};
use crate::notify::{send_best_effort, EmailKind, Notifier};
use crate::schedule::{format_hm, normalize_time};
use crate::service::{Action, InFlight, Shared};
use crate::workflow::{self, ConversionOutcome, ConversionRequest};
use chrono::{NaiveDate, Utc};
use serde_json::Value;

/// Result of a lifecycle action.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusOutcome {
    /// The booking was already in the requested state; nothing was written.
    Unchanged,
    /// The booking row was updated.
    Updated,
    /// Confirming a pending booking ran the conversion workflow.
    Converted(ConversionOutcome),
}

impl StatusOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, StatusOutcome::Unchanged)
    }
}

pub(crate) async fn set_status<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    booking_id: &str,
    target: BookingStatus,
) -> Result<StatusOutcome> {
    let tenant = shared.session.tenant()?;
    let Some(_guard) = InFlight::join(&shared.in_flight, booking_id, Action::Status(target))? else {
        debug!("booking {} already moving to {}, nothing to do", booking_id, target);
        return Ok(StatusOutcome::Unchanged);
    };
    let booking = shared.fetch_booking(tenant, booking_id).await?;

    if booking.status == target {
        debug!("booking {} already {}, nothing to do", booking.id, target);
        return Ok(StatusOutcome::Unchanged);
    }
    if !booking.status.can_transition_to(target) {
        return Err(Error::InvalidTransition {
            from: booking.status.to_string(),
            to: target.to_string(),
        });
    }

    if booking.status == BookingStatus::Pending && target == BookingStatus::Confirmed {
        let (staff_id, service_id) = match (&booking.staff_id, &booking.service_id) {
            (Some(staff), Some(service)) => (staff.clone(), service.clone()),
            _ => {
                return Err(Error::ValidationError(format!(
                    "booking {} needs a staff member and a service before it can be confirmed",
                    booking.id
                )))
            }
        };
        let request = ConversionRequest::new(booking.id.clone(), staff_id, service_id);
        let outcome = workflow::convert_held(shared, &request).await?;
        return Ok(StatusOutcome::Converted(outcome));
    }

    let mut patch = Row::new();
    patch.insert("status".to_string(), Value::from(target.as_str()));
    let updated = write_stamped(shared, booking, patch, "update status", |b| {
        b.status = target;
    })
    .await?;

    info!("booking {} -> {}", updated.id, target);
    shared.events.publish(BookingEvent::StatusChanged {
        booking_id: updated.id.clone(),
        status: target,
    });

    if target == BookingStatus::Cancelled {
        send_best_effort(
            &shared.notifier,
            shared.config.notifications_enabled,
            EmailKind::Cancellation,
            &updated,
        )
        .await;
    }
    Ok(StatusOutcome::Updated)
}

pub(crate) async fn set_archived<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    booking_id: &str,
    archived: bool,
) -> Result<StatusOutcome> {
    let tenant = shared.session.tenant()?;
    let Some(_guard) = InFlight::join(&shared.in_flight, booking_id, Action::Archive(archived))?
    else {
        return Ok(StatusOutcome::Unchanged);
    };
    let booking = shared.fetch_booking(tenant, booking_id).await?;

    if booking.archived == archived {
        return Ok(StatusOutcome::Unchanged);
    }
    if archived && booking.is_pending() {
        return Err(Error::ValidationError(format!(
            "booking {} is still pending and cannot be archived",
            booking.id
        )));
    }

    let mut patch = Row::new();
    patch.insert("archived".to_string(), Value::from(archived));
    let updated = write_stamped(shared, booking, patch, "update archived", |b| {
        b.archived = archived;
    })
    .await?;

    info!(
        "booking {} {}",
        updated.id,
        if archived { "archived" } else { "restored" }
    );
    shared.events.publish(BookingEvent::ArchiveChanged {
        booking_id: updated.id,
        archived,
    });
    Ok(StatusOutcome::Updated)
}

pub(crate) async fn reschedule<G: StoreGateway, N: Notifier>(
    shared: &Shared<G, N>,
    booking_id: &str,
    date: NaiveDate,
    time: &str,
) -> Result<StatusOutcome> {
    let tenant = shared.session.tenant()?;
    let requested = format_hm(normalize_time(time)?);
    let action = Action::Reschedule(date, requested.clone());
    let Some(_guard) = InFlight::join(&shared.in_flight, booking_id, action)? else {
        return Ok(StatusOutcome::Unchanged);
    };
    let booking = shared.fetch_booking(tenant, booking_id).await?;

    let current = normalize_time(&booking.requested_time).map(format_hm).ok();
    if booking.requested_date == date && current.as_deref() == Some(requested.as_str()) {
        return Ok(StatusOutcome::Unchanged);
    }
    if !matches!(
        booking.status,
        BookingStatus::Pending | BookingStatus::Confirmed
    ) {
        return Err(Error::ValidationError(format!(
            "a {} booking cannot be rescheduled",
            booking.status
        )));
    }

    let mut patch = Row::new();
    patch.insert(
        "requested_date".to_string(),
        Value::from(date.format("%Y-%m-%d").to_string()),
    );
    patch.insert("requested_time".to_string(), Value::from(requested.clone()));
    let updated = write_stamped(shared, booking, patch, "reschedule", |b| {
        b.requested_date = date;
        b.requested_time = requested;
    })
    .await?;

    info!(
        "booking {} rescheduled to {} {}",
        updated.id, updated.requested_date, updated.requested_time
    );
    shared.events.publish(BookingEvent::Rescheduled {
        booking_id: updated.id.clone(),
    });
    send_best_effort(
        &shared.notifier,
        shared.config.notifications_enabled,
        EmailKind::Modification,
        &updated,
    )
    .await;
    Ok(StatusOutcome::Updated)
}

/// Write `patch` plus a fresh `updated_at`, then apply the same change locally.
async fn write_stamped<G, N, F>(
    shared: &Shared<G, N>,
    mut booking: BookingRequest,
    mut patch: Row,
    step: &str,
    apply: F,
) -> Result<BookingRequest>
where
    G: StoreGateway,
    N: Notifier,
    F: FnOnce(&mut BookingRequest),
{
    let now = Utc::now();
    patch.insert("updated_at".to_string(), Value::from(now.to_rfc3339()));
    shared
        .write(BookingRequest::TABLE, &booking.id, patch, step)
        .await?;

    apply(&mut booking);
    booking.updated_at = Some(now);
    shared.apply_local(booking.clone()).await;
    Ok(booking)
}
