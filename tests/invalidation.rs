// Integration tests for invalidate_query

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use query_cache::prelude::*;
use tokio::time::{Duration, sleep, timeout};

fn constant(
    value: u32,
    calls: Arc<AtomicUsize>,
) -> impl Fn() -> std::future::Ready<Result<u32, QueryError>> + Send + Sync + 'static {
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(value))
    }
}

#[tokio::test]
async fn test_invalidate_unknown_key_is_noop() {
    let client = QueryClient::<u32>::new();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let _sub = client.subscribe(&"missing", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.invalidate_query(&"missing");

    assert!(client.get_state(&"missing").is_none());
    assert_eq!(notified.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_with_latest_fetcher() {
    let client = QueryClient::new();
    let options = QueryOptions::new(Duration::from_secs(60));
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let value = client
        .fetch_query(&"k", constant(1, first_calls.clone()), options)
        .await;
    assert_eq!(value, Ok(1));

    // Fresh hit, but the second fetcher is remembered anyway.
    let value = client
        .fetch_query(&"k", constant(2, second_calls.clone()), options)
        .await;
    assert_eq!(value, Ok(1));
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);

    let mut updates = client.watch_query(&"k");
    assert!(updates.next().await.is_some_and(|s| s.is_success()));

    client.invalidate_query(&"k");

    let loading = updates.next().await.expect("loading snapshot");
    assert!(loading.is_loading());
    assert!(loading.data().is_none(), "invalidation discards cached data");

    let settled = updates.next().await.expect("settled snapshot");
    assert!(settled.is_success());
    assert_eq!(settled.data(), Some(&2));
    assert_eq!(settled.stale_time(), Duration::from_secs(60));

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_transitions_synchronously() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    client
        .fetch_query(&"k", constant(7, calls.clone()), QueryOptions::default())
        .await
        .expect("fetch should succeed");

    client.invalidate_query(&"k");
    assert!(client.get_state(&"k").is_some_and(|s| s.is_loading()));

    // Joining the refetch does not call the new fetcher.
    let unused = Arc::new(AtomicUsize::new(0));
    let value = client
        .fetch_query(&"k", constant(99, unused.clone()), QueryOptions::default())
        .await;
    assert_eq!(value, Ok(7));
    assert_eq!(unused.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_while_loading_joins_in_flight_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow = move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, QueryError>(n)
        }
    };

    let pending = client.fetch_query(&"k", slow, QueryOptions::default());
    let invalidate = async {
        sleep(Duration::from_millis(10)).await;
        client.invalidate_query(&"k");
    };
    let (value, ()) = tokio::join!(pending, invalidate);

    assert_eq!(value, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_after_error_refetches() {
    let client = QueryClient::<u32>::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(QueryError::new("first attempt fails"))
            } else {
                Ok(10)
            }
        }
    };

    let first = client
        .fetch_query(&"k", flaky, QueryOptions::default())
        .await;
    assert!(first.is_err());

    let mut updates = client.watch_query(&"k");
    assert!(updates.next().await.is_some_and(|s| s.is_error()));

    client.invalidate_query(&"k");
    let settled = timeout(Duration::from_secs(1), async {
        loop {
            match updates.next().await {
                Some(state) if state.is_loading() => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("refetch should settle");

    let settled = settled.expect("stream should stay open");
    assert!(settled.is_success());
    assert_eq!(settled.data(), Some(&10));
}
