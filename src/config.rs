use std::time::Duration;

/// Per-call options for [`QueryClient::fetch_query`](crate::client::QueryClient::fetch_query).
///
/// This controls how long a successful result is served from cache before
/// the next call fetches again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long data is considered fresh after a successful fetch.
    ///
    /// While fresh, calls return the cached value without invoking the fetcher.
    /// Defaults to zero, which means data is immediately stale.
    pub stale_time: Duration,
}

impl QueryOptions {
    /// Creates options with the given stale time.
    #[must_use]
    pub const fn new(stale_time: Duration) -> Self {
        Self { stale_time }
    }

    /// Returns a copy with the stale time replaced.
    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = QueryOptions::default();
        assert_eq!(options.stale_time, Duration::ZERO);
    }

    #[test]
    fn test_new_options() {
        let options = QueryOptions::new(Duration::from_secs(30));
        assert_eq!(options.stale_time, Duration::from_secs(30));
    }

    #[test]
    fn test_with_stale_time() {
        let options = QueryOptions::default().with_stale_time(Duration::from_millis(250));
        assert_eq!(options.stale_time, Duration::from_millis(250));
    }
}
