//! Deduplicating local cache of booking requests.
//!
//! The cache holds the visible set of [`BookingRequest`]s for one view
//! (active or archived, optionally narrowed to a status). It is fed from two
//! paths: bulk refetches through [`BookingCache::replace_or_merge`] and single
//! change-feed events through the `apply_*` methods.
//!
//! The same logical change can arrive twice: once from an optimistic local
//! write and once as the realtime echo. Every mutation is therefore keyed by
//! record id and resolved newest-wins on [`BookingRequest::revision`]. Events
//! are not special-cased by origin.
//!
//! Ordering of the visible set is `created_at` descending.

use crate::entity::Record;
use crate::error::Result;
use crate::gateway::{ChangeEvent, ChangeKind};
use crate::models::{BookingRequest, BookingStatus};
use std::collections::HashMap;

/// Which bookings are visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ViewFilter {
    /// Show archived (`true`) or active (`false`) bookings.
    pub archived: bool,
    /// Optionally narrow to a single status.
    pub status: Option<BookingStatus>,
}

impl ViewFilter {
    /// Active (non-archived) bookings of any status.
    pub fn active() -> Self {
        ViewFilter {
            archived: false,
            status: None,
        }
    }

    /// Archived bookings of any status.
    pub fn archived() -> Self {
        ViewFilter {
            archived: true,
            status: None,
        }
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, booking: &BookingRequest) -> bool {
        booking.archived == self.archived && self.status.map_or(true, |s| booking.status == s)
    }
}

/// What a single-record mutation did to the visible set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Duplicate delivery, stale revision, or a record outside the view.
    Ignored,
}

impl CacheOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, CacheOutcome::Ignored)
    }
}

/// Counters from one [`BookingCache::replace_or_merge`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub replaced: usize,
    pub kept: usize,
    pub dropped: usize,
}

/// In-memory ordered set of booking requests for one view.
#[derive(Clone, Debug, Default)]
pub struct BookingCache {
    view: ViewFilter,
    rows: Vec<BookingRequest>,
}

impl BookingCache {
    pub fn new(view: ViewFilter) -> Self {
        BookingCache {
            view,
            rows: Vec::new(),
        }
    }

    pub fn view(&self) -> ViewFilter {
        self.view
    }

    /// Switch to another view. The visible set is emptied; callers refetch.
    pub fn set_view(&mut self, view: ViewFilter) {
        if self.view != view {
            debug!("cache view {:?} -> {:?}", self.view, view);
            self.view = view;
            self.rows.clear();
        }
    }

    /// Visible bookings, newest first.
    pub fn list(&self) -> &[BookingRequest] {
        &self.rows
    }

    pub fn get(&self, id: &str) -> Option<&BookingRequest> {
        self.rows.iter().find(|b| b.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Number of visible bookings still awaiting review.
    pub fn pending_count(&self) -> usize {
        self.rows.iter().filter(|b| b.is_pending()).count()
    }

    /// Merge a refetched batch into the visible set.
    ///
    /// For each incoming row an existing row with the same id is replaced only
    /// if its revision is strictly earlier. Rows outside the view are dropped.
    /// The result is deduplicated by id and sorted by `created_at` descending.
    pub fn replace_or_merge(&mut self, incoming: Vec<BookingRequest>) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut index: HashMap<String, usize> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id.clone(), i))
            .collect();

        for booking in incoming {
            if !self.view.matches(&booking) {
                stats.dropped += 1;
                continue;
            }
            match index.get(&booking.id) {
                Some(&i) => {
                    if self.rows[i].revision() < booking.revision() {
                        self.rows[i] = booking;
                        stats.replaced += 1;
                    } else {
                        stats.kept += 1;
                    }
                }
                None => {
                    index.insert(booking.id.clone(), self.rows.len());
                    self.rows.push(booking);
                    stats.added += 1;
                }
            }
        }

        self.sort();
        debug!(
            "cache merge: {} added, {} replaced, {} kept, {} dropped ({} visible)",
            stats.added,
            stats.replaced,
            stats.kept,
            stats.dropped,
            self.rows.len()
        );
        stats
    }

    /// Apply an inserted row, ahead of every older row.
    ///
    /// A row already present is a duplicate delivery and is ignored. Rows
    /// outside the view are dropped silently.
    pub fn apply_insert(&mut self, booking: BookingRequest) -> CacheOutcome {
        if self.contains(&booking.id) {
            trace!("cache insert {}: duplicate delivery", booking.id);
            return CacheOutcome::Ignored;
        }
        if !self.view.matches(&booking) {
            return CacheOutcome::Ignored;
        }
        self.insert_sorted(booking);
        CacheOutcome::Inserted
    }

    /// Apply an updated row.
    ///
    /// Updates older than the cached revision are ignored. A row that no
    /// longer matches the view is removed (it moved to another view); a row
    /// that now matches but was not visible is inserted in order.
    pub fn apply_update(&mut self, booking: BookingRequest) -> CacheOutcome {
        let existing = self.position(&booking.id);

        if let Some(i) = existing {
            if self.rows[i].revision() > booking.revision() {
                debug!(
                    "cache update {}: stale revision {} < {}",
                    booking.id,
                    booking.revision(),
                    self.rows[i].revision()
                );
                return CacheOutcome::Ignored;
            }
        }

        match (existing, self.view.matches(&booking)) {
            (Some(i), true) => {
                self.rows[i] = booking;
                CacheOutcome::Replaced
            }
            (Some(i), false) => {
                self.rows.remove(i);
                CacheOutcome::Removed
            }
            (None, true) => {
                self.insert_sorted(booking);
                CacheOutcome::Inserted
            }
            (None, false) => CacheOutcome::Ignored,
        }
    }

    /// Remove a row by id; no-op if absent.
    pub fn apply_delete(&mut self, id: &str) -> CacheOutcome {
        match self.position(id) {
            Some(i) => {
                self.rows.remove(i);
                CacheOutcome::Removed
            }
            None => CacheOutcome::Ignored,
        }
    }

    /// Decode a change-feed event and route it to the matching `apply_*` method.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecodeError` if an insert/update row cannot be decoded.
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<CacheOutcome> {
        let outcome = match event.kind {
            ChangeKind::Insert => self.apply_insert(BookingRequest::from_row(event.row.clone())?),
            ChangeKind::Update => self.apply_update(BookingRequest::from_row(event.row.clone())?),
            ChangeKind::Delete => match event.row_id() {
                Some(id) => self.apply_delete(id),
                None => CacheOutcome::Ignored,
            },
        };
        Ok(outcome)
    }

    /// New rows are normally the newest, so this is a prepend in practice.
    fn insert_sorted(&mut self, booking: BookingRequest) {
        let at = self
            .rows
            .iter()
            .position(|b| b.created_at < booking.created_at)
            .unwrap_or(self.rows.len());
        self.rows.insert(at, booking);
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|b| b.id == id)
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
