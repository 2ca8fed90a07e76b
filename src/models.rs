//! Table-backed records: booking requests, appointments, line items,
//! customers and salon services.

use crate::entity::{blank_as_none, hm_time, lenient_f64, null_as_default, Record};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tenant key column shared by every tenant-scoped table.
pub const TENANT_COLUMN: &str = "salon_id";

// ============================================================================
// Booking requests
// ============================================================================

/// Status of an online booking request.
///
/// Exactly one status holds at a time. `archived` is tracked separately on
/// [`BookingRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Submitted by the customer, awaiting staff review.
    #[default]
    Pending,
    /// Accepted by staff. A successfully converted booking stays here.
    Confirmed,
    /// Rejected by staff or withdrawn.
    Cancelled,
    /// The service was delivered.
    Completed,
    /// Marked as converted by a legacy flow.
    Converted,
}

impl BookingStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::Converted => "converted",
        }
    }

    /// Whether staff may move a booking from `self` to `target`.
    ///
    /// Same-status requests are not transitions; callers treat them as no-ops.
    pub fn can_transition_to(&self, target: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, target),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
                | (Confirmed, Converted)
                | (Completed, Converted)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            "converted" => Ok(BookingStatus::Converted),
            other => Err(Error::ValidationError(format!(
                "unknown booking status: {}",
                other
            ))),
        }
    }
}

/// An externally submitted request for a service slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: String,
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_name: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub customer_email: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub customer_phone: Option<String>,
    pub requested_date: NaiveDate,
    #[serde(deserialize_with = "hm_time")]
    pub requested_time: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub service_id: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub service_duration: Option<u32>,
    #[serde(default)]
    pub service_price: Option<f64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub staff_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub notes: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: BookingStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BookingRequest {
    /// Timestamp used for newest-wins conflict resolution.
    ///
    /// Rows never updated fall back to their creation time.
    pub fn revision(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn is_pending(&self) -> bool {
        self.status == BookingStatus::Pending
    }

    /// Display label for the requested service.
    pub fn service_label(&self) -> &str {
        self.service_name.as_deref().unwrap_or("")
    }
}

impl Record for BookingRequest {
    const TABLE: &'static str = "online_bookings";

    fn record_id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::DecodeError("booking without id".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Appointments
// ============================================================================

/// Status of an internal appointment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
}

/// An internal scheduled service instance (`orders` table).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    pub customer_id: String,
    #[serde(rename = "team_id")]
    pub staff_id: String,
    #[serde(rename = "data")]
    pub date: NaiveDate,
    #[serde(rename = "orarioInizio")]
    pub start_time: String,
    #[serde(rename = "orarioFine")]
    pub end_time: String,
    #[serde(rename = "prezzo", default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub note: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: AppointmentStatus,
    /// Originating booking request, if any.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Appointment {
    const TABLE: &'static str = "orders";

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Insert payload for [`Appointment`]. The store assigns the id.
#[derive(Clone, Debug, Serialize)]
pub struct NewAppointment {
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    pub customer_id: String,
    #[serde(rename = "team_id")]
    pub staff_id: String,
    #[serde(rename = "data")]
    pub date: NaiveDate,
    #[serde(rename = "orarioInizio")]
    pub start_time: String,
    #[serde(rename = "orarioFine")]
    pub end_time: String,
    #[serde(rename = "prezzo")]
    pub price: f64,
    pub note: String,
    pub status: AppointmentStatus,
    pub booking_id: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Service line items
// ============================================================================

/// A service applied to an appointment (`order_services` table).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceLineItem {
    pub id: String,
    #[serde(rename = "order_id")]
    pub appointment_id: String,
    pub service_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_name: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
}

impl Record for ServiceLineItem {
    const TABLE: &'static str = "order_services";

    fn record_id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NewServiceLineItem {
    #[serde(rename = "order_id")]
    pub appointment_id: String,
    pub service_id: String,
    pub service_name: String,
    pub price: f64,
}

// ============================================================================
// Customers
// ============================================================================

/// A client record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub note: String,
}

impl Record for Customer {
    const TABLE: &'static str = "customers";

    fn record_id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NewCustomer {
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub note: String,
}

// ============================================================================
// Services offered by the salon
// ============================================================================

/// A bookable service from the salon's catalogue (`services` table).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SalonService {
    pub id: String,
    #[serde(rename = "salon_id")]
    pub tenant_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Duration in minutes.
    #[serde(default, deserialize_with = "null_as_default")]
    pub duration: u32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
}

impl Record for SalonService {
    const TABLE: &'static str = "services";

    fn record_id(&self) -> &str {
        &self.id
    }
}
