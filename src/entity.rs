//! Typed record trait and the row normalization boundary.
//!
//! The store speaks in loosely-shaped JSON rows. Every typed record crosses
//! into the crate through [`Record::from_row`], which is the only place where
//! missing or `null` fields are defaulted.

use crate::error::{Error, Result};
use crate::schedule::{format_hm, normalize_time};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A raw row as returned by the store.
pub type Row = Map<String, Value>;

/// Trait implemented by every table-backed record.
///
/// # Example
///
/// ```
/// use booking_sync::entity::Record;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Room {
///     id: String,
///     name: String,
/// }
///
/// impl Record for Room {
///     const TABLE: &'static str = "rooms";
///
///     fn record_id(&self) -> &str {
///         &self.id
///     }
/// }
/// ```
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the backing table.
    const TABLE: &'static str;

    /// Return the record's identity.
    fn record_id(&self) -> &str;

    /// Decode a store row into this record.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecodeError` when a required field is missing or has
    /// the wrong shape, or when [`Record::validate`] rejects the record.
    fn from_row(row: Row) -> Result<Self> {
        let record: Self = serde_json::from_value(Value::Object(row))
            .map_err(|e| Error::DecodeError(format!("{}: {}", Self::TABLE, e)))?;
        record.validate()?;
        Ok(record)
    }

    /// Encode this record as a store row.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecodeError` if the record does not serialize to an object.
    fn to_row(&self) -> Result<Row> {
        encode_row(self)
    }

    /// Optional: validate the record after decoding. Called by `from_row`.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Encode any serializable value (typically an insert payload) as a row.
///
/// # Errors
///
/// Returns `Error::DecodeError` if the value does not serialize to an object.
pub fn encode_row<T: Serialize + ?Sized>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::DecodeError(format!(
            "expected an object row, found {}",
            other
        ))),
    }
}

/// Decode a batch of rows. The first invalid row fails the batch.
pub fn decode_rows<T: Record>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(T::from_row).collect()
}

/// Deserialize `null` or a missing field as `T::default()`.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Deserialize an optional string, treating blank strings as absent.
pub(crate) fn blank_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}

/// Deserialize a time of day as `HH:MM`, dropping seconds.
///
/// Values that do not parse as a time are kept trimmed so that the workflow
/// that needs the time can report them.
pub(crate) fn hm_time<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_time(&raw)
        .map(format_hm)
        .unwrap_or_else(|_| raw.trim().to_string()))
}

/// Deserialize a number that some rows store as a string.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or_default()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number, found {}",
            other
        ))),
    }
}
