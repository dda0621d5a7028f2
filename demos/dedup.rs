//! Deduplication and invalidation walkthrough.
//!
//! This example shows:
//! - Concurrent callers sharing one in-flight fetch
//! - Cached values served inside the stale time
//! - A listener observing every state change
//! - Invalidation refetching with the remembered fetcher
//! - Failures keeping the last good value
//!
//! Run with: `RUST_LOG=query_cache=debug cargo run --example dedup`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use color_eyre::eyre::{Result, eyre};
use futures::StreamExt;
use futures::future::BoxFuture;
use query_cache::prelude::*;
use tokio::time::sleep;
use tracing::info;

/// Pretends to be a slow remote lookup returning a new value on every call.
fn slow_lookup(
    calls: Arc<AtomicU64>,
) -> impl Fn() -> BoxFuture<'static, Result<u64, QueryError>> + Clone + Send + Sync + 'static {
    move || -> BoxFuture<'static, Result<u64, QueryError>> {
        let calls = calls.clone();
        Box::pin(async move {
            sleep(Duration::from_millis(200)).await;
            Ok(calls.fetch_add(1, Ordering::SeqCst) * 100 + 42)
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "query_cache=debug,dedup=info".into()),
        )
        .init();

    let client = QueryClient::<u64>::new();
    let calls = Arc::new(AtomicU64::new(0));
    let options = QueryOptions::new(Duration::from_secs(2));

    let reader = client.clone();
    let _subscription = client.subscribe(&"answer", move || {
        if let Some(state) = reader.get_state(&"answer") {
            info!(status = ?state.status(), data = ?state.data(), "answer changed");
        }
    });

    // Three callers, one fetch.
    let (a, b, c) = tokio::join!(
        client.fetch_query(&"answer", slow_lookup(calls.clone()), options),
        client.fetch_query(&"answer", slow_lookup(calls.clone()), options),
        client.fetch_query(&"answer", slow_lookup(calls.clone()), options),
    );
    info!(a = ?a, b = ?b, c = ?c, fetches = calls.load(Ordering::SeqCst), "concurrent callers");

    let cached = client
        .fetch_query(&"answer", slow_lookup(calls.clone()), options)
        .await?;
    info!(cached, fetches = calls.load(Ordering::SeqCst), "served from cache");

    let mut updates = client.watch_query(&"answer");
    let _ = updates.next().await;
    client.invalidate_query(&"answer");
    while let Some(state) = updates.next().await {
        if !state.is_loading() {
            info!(data = ?state.data(), fetches = calls.load(Ordering::SeqCst), "refetched after invalidation");
            break;
        }
    }

    let failed = client
        .fetch_query(
            &"answer",
            || async { Err::<u64, _>(eyre!("upstream unavailable")) },
            QueryOptions::default(),
        )
        .await;
    let state = client
        .get_state(&"answer")
        .ok_or_else(|| eyre!("answer should be cached"))?;
    info!(
        error = ?failed.err(),
        status = ?state.status(),
        kept = ?state.data(),
        "failure keeps the last good value"
    );

    Ok(())
}
