//! Fetch strategies for listing bookings.
//!
//! | Strategy | Reads store | Touches cache | Use case |
//! |----------|-------------|---------------|----------|
//! | **Cached** | No | Read only | Re-render from local state |
//! | **Merge** | Yes | Newest-wins merge | Default refresh |
//! | **Replace** | Yes | Cleared, then loaded | View switch, suspected drift |
//! | **Bypass** | Yes | No | One-off reads (exports, checks) |

/// Strategy controlling how `list_bookings` combines store and cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchStrategy {
    /// Return the local visible set without querying the store.
    Cached,

    /// Query the store and merge the rows into the cache (newest wins).
    #[default]
    Merge,

    /// Clear the cache, then load it from the store.
    Replace,

    /// Query the store and return rows without touching the cache.
    Bypass,
}

impl FetchStrategy {
    pub fn reads_store(&self) -> bool {
        !matches!(self, FetchStrategy::Cached)
    }
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStrategy::Cached => write!(f, "Cached"),
            FetchStrategy::Merge => write!(f, "Merge"),
            FetchStrategy::Replace => write!(f, "Replace"),
            FetchStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
