//! Error types for booking reconciliation.

use std::fmt;

/// Result type for booking operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for booking reconciliation.
///
/// Workflow-level errors abort the remaining steps of a multi-step write and are
/// returned to the caller. Steps that already succeeded are not rolled back.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Tenant or other required context could not be resolved.
    ///
    /// Fatal to the current action. Not retried.
    ConfigurationError(String),

    /// No authenticated actor is available for the current action.
    ///
    /// **Recovery:** The host should send the user through authentication again.
    AuthError(String),

    /// A referenced record does not exist.
    ///
    /// Raised for missing services, customers and booking requests.
    NotFound {
        /// Entity kind, e.g. `"service"`
        entity: String,
        /// Identifier that was looked up
        id: String,
    },

    /// A single insert, update or delete failed at the store.
    ///
    /// Common causes:
    /// - Constraint violation (e.g. a second appointment for the same booking)
    /// - Row-level security rejection
    ///
    /// Prior steps of the same workflow are **not** rolled back.
    WriteError(String),

    /// A read query failed at the store.
    QueryError(String),

    /// Transport-level failure (network, closed channel).
    ///
    /// **Recovery:** Realtime subscriptions retry these with backoff.
    TransportError(String),

    /// Input rejected before touching the store.
    ValidationError(String),

    /// Requested status change is not allowed from the current status.
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Another operation on the same record is already running.
    Conflict(String),

    /// A row returned by the store could not be decoded into its typed record.
    DecodeError(String),

    /// An outbound notification could not be delivered.
    ///
    /// Never fatal to a workflow; callers log it and continue.
    NotificationError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True for failures of the underlying connection rather than of the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransportError(_))
    }

    /// True when repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportError(_) | Error::QueryError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            Error::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Error::NotFound { entity, id } => write!(f, "Not found: {} {}", entity, id),
            Error::WriteError(msg) => write!(f, "Write error: {}", msg),
            Error::QueryError(msg) => write!(f, "Query error: {}", msg),
            Error::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition: {} -> {}", from, to)
            }
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::DecodeError(msg) => write!(f, "Decode error: {}", msg),
            Error::NotificationError(msg) => write!(f, "Notification error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DecodeError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("service", "s1");
        assert_eq!(err.to_string(), "Not found: service s1");

        let err = Error::InvalidTransition {
            from: "cancelled".to_string(),
            to: "confirmed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition: cancelled -> confirmed"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::DecodeError(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransportError("reset".into()).is_retryable());
        assert!(Error::TransportError("reset".into()).is_transport());
        assert!(!Error::WriteError("duplicate key".into()).is_retryable());
        assert!(!Error::AuthError("no session".into()).is_transport());
    }
}
