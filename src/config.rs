//! Configuration and explicit request context.

use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Realtime subscription tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Automatic retries before the subscription is marked failed (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt (default: 1s).
    pub base_delay: Duration,
    /// How often the liveness check runs (default: 30s).
    pub heartbeat_interval: Duration,
    /// Silence after which a subscribed channel is presumed dead (default: 2 min).
    pub stale_after: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl RealtimeConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.stale_after = stale_after;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base_delay * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

/// Top-level configuration for [`crate::BookingService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingConfig {
    /// Send confirmation/modification/cancellation emails (default: true).
    pub notifications_enabled: bool,
    /// Maximum rows fetched per list call. `None` fetches everything.
    pub list_limit: Option<usize>,
    pub realtime: RealtimeConfig,
}

impl Default for BookingConfig {
    fn default() -> Self {
        BookingConfig {
            notifications_enabled: true,
            list_limit: None,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl BookingConfig {
    /// Read configuration from `BOOKINGS_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `BOOKINGS_NOTIFICATIONS_ENABLED` | `notifications_enabled` |
    /// | `BOOKINGS_LIST_LIMIT` | `list_limit` |
    /// | `BOOKINGS_REALTIME_MAX_RETRIES` | `realtime.max_retries` |
    /// | `BOOKINGS_REALTIME_BASE_DELAY_MS` | `realtime.base_delay` |
    /// | `BOOKINGS_REALTIME_HEARTBEAT_SECS` | `realtime.heartbeat_interval` |
    /// | `BOOKINGS_REALTIME_STALE_AFTER_SECS` | `realtime.stale_after` |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`BookingConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BookingConfig::default();
        let parse_u64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        let notifications_enabled = lookup("BOOKINGS_NOTIFICATIONS_ENABLED")
            .and_then(|s| parse_flag(&s))
            .unwrap_or(defaults.notifications_enabled);

        let list_limit = parse_u64("BOOKINGS_LIST_LIMIT")
            .map(|n| n as usize)
            .or(defaults.list_limit);

        let realtime = RealtimeConfig {
            max_retries: parse_u64("BOOKINGS_REALTIME_MAX_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.realtime.max_retries),
            base_delay: parse_u64("BOOKINGS_REALTIME_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.realtime.base_delay),
            heartbeat_interval: parse_u64("BOOKINGS_REALTIME_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.realtime.heartbeat_interval),
            stale_after: parse_u64("BOOKINGS_REALTIME_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.realtime.stale_after),
        };

        BookingConfig {
            notifications_enabled,
            list_limit,
            realtime,
        }
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications_enabled = enabled;
        self
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = Some(limit);
        self
    }

    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Who is acting, and for which tenant.
///
/// Passed explicitly to every workflow instead of being read from ambient state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub tenant_id: Option<String>,
    pub actor_id: Option<String>,
}

impl Session {
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Session {
            tenant_id: Some(tenant_id.into()),
            actor_id: Some(actor_id.into()),
        }
    }

    /// Resolve the tenant id.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigurationError` if no tenant is set.
    pub fn tenant(&self) -> Result<&str> {
        match self.tenant_id.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(Error::ConfigurationError(
                "tenant could not be resolved".to_string(),
            )),
        }
    }

    /// Resolve the authenticated actor id.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthError` if nobody is signed in.
    pub fn actor(&self) -> Result<&str> {
        match self.actor_id.as_deref() {
            Some(a) if !a.trim().is_empty() => Ok(a),
            _ => Err(Error::AuthError("no authenticated user".to_string())),
        }
    }
}
