//! Appointment time arithmetic.

use crate::error::{Error, Result};
use chrono::{Duration, NaiveTime, Timelike};

/// Start and end of an appointment on its calendar day, formatted `HH:MM`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppointmentWindow {
    pub start: String,
    pub end: String,
    /// The end time wrapped past midnight. The appointment date is not advanced.
    pub crosses_midnight: bool,
}

/// Parse `HH:MM` or `HH:MM:SS`, dropping seconds.
///
/// # Errors
///
/// Returns `Error::ValidationError` for anything else.
pub fn normalize_time(raw: &str) -> Result<NaiveTime> {
    let trimmed = raw.trim();
    let parsed = NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| Error::ValidationError(format!("invalid time: {:?}", raw)))?;
    NaiveTime::from_hms_opt(parsed.hour(), parsed.minute(), 0)
        .ok_or_else(|| Error::ValidationError(format!("invalid time: {:?}", raw)))
}

pub fn format_hm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Compute the appointment window for a start time and a duration in minutes.
///
/// ```
/// use booking_sync::schedule::appointment_window;
///
/// let window = appointment_window("09:58:00", 45).unwrap();
/// assert_eq!(window.start, "09:58");
/// assert_eq!(window.end, "10:43");
///
/// let late = appointment_window("23:40", 30).unwrap();
/// assert_eq!(late.end, "00:10");
/// assert!(late.crosses_midnight);
/// ```
///
/// # Errors
///
/// Returns `Error::ValidationError` if `start` is not a valid time.
pub fn appointment_window(start: &str, duration_minutes: u32) -> Result<AppointmentWindow> {
    let start = normalize_time(start)?;
    let (end, wrapped_secs) =
        start.overflowing_add_signed(Duration::minutes(i64::from(duration_minutes)));

    Ok(AppointmentWindow {
        start: format_hm(start),
        end: format_hm(end),
        crosses_midnight: wrapped_secs != 0,
    })
}
