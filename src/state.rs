//! Query state snapshots.
//!
//! A [`QueryState`] is owned by the cache; callers only ever see clones of it.
//! The transition helpers are crate-private so the invariants between
//! [`QueryStatus`], `data` and `error` can only be changed by the coordinator.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;

/// The lifecycle status of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Nothing has been fetched yet.
    #[default]
    Idle,
    /// A fetch is in flight.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed.
    Error,
}

/// The cached state of a single query key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    data: Option<T>,
    status: QueryStatus,
    error: Option<QueryError>,
    last_fetched_at: Option<Instant>,
    stale_time: Duration,
}

impl<T> QueryState<T> {
    pub(crate) const fn idle(stale_time: Duration) -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            last_fetched_at: None,
            stale_time,
        }
    }

    /// Moves into `Loading`, keeping any previous data visible.
    pub(crate) fn into_loading(self, stale_time: Duration) -> Self {
        Self {
            status: QueryStatus::Loading,
            error: None,
            stale_time,
            ..self
        }
    }

    pub(crate) fn into_success(self, data: T, fetched_at: Instant) -> Self {
        Self {
            data: Some(data),
            status: QueryStatus::Success,
            error: None,
            last_fetched_at: Some(fetched_at),
            ..self
        }
    }

    /// Moves into `Error`. The last successful data is kept.
    pub(crate) fn into_error(self, error: QueryError) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            ..self
        }
    }

    /// Returns the last successfully fetched data, if any.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns the current status.
    pub const fn status(&self) -> QueryStatus {
        self.status
    }

    /// Returns the error of the last fetch, present only in `Error` status.
    pub const fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    /// Returns when the last successful fetch completed.
    pub const fn last_fetched_at(&self) -> Option<Instant> {
        self.last_fetched_at
    }

    /// Returns the stale time recorded by the call that last started a fetch.
    pub const fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// Returns `true` if the query is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the query succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the query failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if this is a successful result younger than `stale_time` at `now`.
    pub fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
        match (self.status, self.last_fetched_at) {
            (QueryStatus::Success, Some(at)) => now.saturating_duration_since(at) < stale_time,
            _ => false,
        }
    }
}
