//! Prelude module for convenient imports.
//!
//! ```
//! use query_cache::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The cache and its operations
//! - [`QueryOptions`] - Per-call fetch options
//! - [`QueryState`] and [`QueryStatus`] - State snapshots
//! - [`QueryError`] - Fetch failures
//! - [`Subscription`] - Listener handles

pub use crate::client::QueryClient;
pub use crate::config::QueryOptions;
pub use crate::error::QueryError;
pub use crate::notifier::Subscription;
pub use crate::state::{QueryState, QueryStatus};
