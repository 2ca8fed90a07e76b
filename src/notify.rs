//! Outbound booking notifications (confirmation, modification, cancellation).
//!
//! Delivery is an external service. Callers never block a workflow's success
//! on the result: failures are logged and dropped.

use crate::error::Result;
use crate::models::BookingRequest;
use serde::Serialize;
use std::future::Future;

/// Payload shared by every booking email.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingEmail {
    pub to: String,
    pub customer_name: String,
    pub service_name: String,
    pub date: String,
    pub time: String,
}

impl BookingEmail {
    /// Build the payload for `booking`, or `None` if it has no email address.
    pub fn for_booking(booking: &BookingRequest) -> Option<Self> {
        let to = booking.customer_email.clone()?;
        Some(BookingEmail {
            to,
            customer_name: booking.customer_name.clone(),
            service_name: booking.service_label().to_string(),
            date: booking.requested_date.format("%Y-%m-%d").to_string(),
            time: booking.requested_time.clone(),
        })
    }
}

/// Notification service.
pub trait Notifier: Send + Sync + 'static {
    /// # Errors
    /// Returns `Error::NotificationError` if the message was not accepted.
    fn send_booking_confirmation(
        &self,
        email: &BookingEmail,
    ) -> impl Future<Output = Result<()>> + Send;

    /// # Errors
    /// Returns `Error::NotificationError` if the message was not accepted.
    fn send_booking_modification(
        &self,
        email: &BookingEmail,
    ) -> impl Future<Output = Result<()>> + Send;

    /// # Errors
    /// Returns `Error::NotificationError` if the message was not accepted.
    fn send_booking_cancellation(
        &self,
        email: &BookingEmail,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Notifier that sends nothing.
#[derive(Clone, Debug, Default)]
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    async fn send_booking_confirmation(&self, email: &BookingEmail) -> Result<()> {
        trace!("confirmation email to {} skipped", email.to);
        Ok(())
    }

    async fn send_booking_modification(&self, email: &BookingEmail) -> Result<()> {
        trace!("modification email to {} skipped", email.to);
        Ok(())
    }

    async fn send_booking_cancellation(&self, email: &BookingEmail) -> Result<()> {
        trace!("cancellation email to {} skipped", email.to);
        Ok(())
    }
}

/// Which email a workflow wants sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EmailKind {
    Confirmation,
    Modification,
    Cancellation,
}

/// Send `kind` for `booking` if enabled and an address exists.
///
/// Returns whether a send was attempted and accepted. Errors are logged only.
pub(crate) async fn send_best_effort<N: Notifier>(
    notifier: &N,
    enabled: bool,
    kind: EmailKind,
    booking: &BookingRequest,
) -> bool {
    if !enabled {
        return false;
    }
    let email = match BookingEmail::for_booking(booking) {
        Some(email) => email,
        None => return false,
    };

    let result = match kind {
        EmailKind::Confirmation => notifier.send_booking_confirmation(&email).await,
        EmailKind::Modification => notifier.send_booking_modification(&email).await,
        EmailKind::Cancellation => notifier.send_booking_cancellation(&email).await,
    };

    match result {
        Ok(()) => {
            debug!("{:?} email sent for booking {}", kind, booking.id);
            true
        }
        Err(e) => {
            warn!(
                "{:?} email for booking {} failed: {}",
                kind, booking.id, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::BookingStatus;
    use chrono::{NaiveDate, Utc};

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        async fn send_booking_confirmation(&self, _email: &BookingEmail) -> Result<()> {
            Err(Error::NotificationError("smtp down".to_string()))
        }

        async fn send_booking_modification(&self, _email: &BookingEmail) -> Result<()> {
            Err(Error::NotificationError("smtp down".to_string()))
        }

        async fn send_booking_cancellation(&self, _email: &BookingEmail) -> Result<()> {
            Err(Error::NotificationError("smtp down".to_string()))
        }
    }

    fn booking(email: Option<&str>) -> BookingRequest {
        BookingRequest {
            id: "b1".to_string(),
            tenant_id: "salon-1".to_string(),
            customer_name: "Marta".to_string(),
            customer_email: email.map(str::to_string),
            customer_phone: None,
            requested_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            requested_time: "14:00".to_string(),
            service_id: Some("s1".to_string()),
            service_name: Some("Piega".to_string()),
            service_duration: Some(30),
            service_price: Some(40.0),
            staff_id: None,
            notes: String::new(),
            status: BookingStatus::Pending,
            archived: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_email_payload() {
        let email = BookingEmail::for_booking(&booking(Some("m@x.com"))).unwrap();
        assert_eq!(email.to, "m@x.com");
        assert_eq!(email.service_name, "Piega");
        assert_eq!(email.date, "2024-05-01");

        let json = serde_json::to_value(&email).unwrap();
        assert!(json.get("customerName").is_some());

        assert!(BookingEmail::for_booking(&booking(None)).is_none());
    }

    #[tokio::test]
    async fn test_send_best_effort_swallows_errors() {
        let sent = send_best_effort(
            &FailingNotifier,
            true,
            EmailKind::Confirmation,
            &booking(Some("m@x.com")),
        )
        .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_send_best_effort_respects_flag_and_address() {
        let b = booking(Some("m@x.com"));
        assert!(send_best_effort(&NoOpNotifier, true, EmailKind::Cancellation, &b).await);
        assert!(!send_best_effort(&NoOpNotifier, false, EmailKind::Cancellation, &b).await);
        assert!(!send_best_effort(&NoOpNotifier, true, EmailKind::Cancellation, &booking(None)).await);
    }
}
