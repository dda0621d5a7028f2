//! # query-cache - In-memory data-fetching cache
//!
//! A small cache for asynchronously fetched values, in the spirit of SWR and
//! TanStack Query. Values are grouped under string keys; for each key the
//! cache fetches at most once per freshness window, shares an in-flight fetch
//! between every concurrent caller, and notifies listeners whenever the cached
//! state changes.
//!
//! ## Core Components
//!
//! - [`QueryClient`](client::QueryClient): The cache handle and its four operations
//! - [`QueryState`](state::QueryState): Immutable snapshot of one key's state
//! - [`Subscription`](notifier::Subscription): Handle returned by `subscribe`
//! - [`QueryOptions`](config::QueryOptions): Per-call stale time
//! - [`QueryError`](error::QueryError): The single, message-bearing fetch failure
//!
//! ## State Machine
//!
//! ```text
//! idle ──fetch──▶ loading ──ok──▶ success ──fetch (stale)──▶ loading
//!                    │
//!                    └──err──▶ error ──fetch──▶ loading
//! ```
//!
//! `success` and `error` are the only resting states. A failed fetch keeps the
//! last successful data around.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use query_cache::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueryError> {
//!     let client = QueryClient::<u64>::new();
//!
//!     let _subscription = client.subscribe(&"answer", || println!("answer changed"));
//!
//!     let options = QueryOptions::new(Duration::from_secs(10));
//!     let answer = client
//!         .fetch_query(&"answer", || async { Ok::<_, QueryError>(42) }, options)
//!         .await?;
//!     assert_eq!(answer, 42);
//!
//!     client.invalidate_query(&"answer");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod notifier;
pub mod prelude;
pub mod state;
mod store;

pub use client::QueryClient;
pub use config::QueryOptions;
pub use error::QueryError;
pub use notifier::Subscription;
pub use state::{QueryState, QueryStatus};
