//! Tests for the mutation executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use query_cache::{MutationOptions, Query, QueryOptions, Signal};

#[tokio::test]
async fn test_rejected_mutation() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let settled = Arc::new(AtomicUsize::new(0));
    let (e, s) = (errors.clone(), settled.clone());
    let mutation = MutationOptions::new(|_: u32| async move { Err::<(), _>("boom".to_string()) })
        .on_success(|_| panic!("should not succeed"))
        .on_error(move |error| e.lock().push(error.clone()))
        .on_settled(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    assert_eq!(mutation.mutate(1).await, None);

    assert_eq!(*errors.lock(), vec!["boom".to_string()]);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
    assert!(!mutation.is_loading());
}

#[tokio::test]
async fn test_calls_are_not_deduplicated() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let mutation = MutationOptions::new(move |n: u32| {
        c.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::task::yield_now().await;
            Ok::<_, String>(n * 2)
        }
    })
    .build();

    let (a, b) = tokio::join!(mutation.mutate(1), mutation.mutate(1));

    assert_eq!((a, b), (Some(2), Some(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!mutation.is_loading());
}

#[tokio::test]
async fn test_loading_signal_transitions() {
    let mutation = MutationOptions::new(|_: ()| async move { Ok::<_, String>(()) }).build();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let signal = mutation.loading_signal().clone();
    let _sub = mutation.loading_signal().subscribe(move || s.lock().push(signal.get()));

    mutation.mutate(()).await;

    assert_eq!(*seen.lock(), vec![true, false]);
}

#[tokio::test]
async fn test_mutation_updates_query_cache() {
    let query: Query<u32, String, String> =
        QueryOptions::new(Signal::new(1u32), |id: u32| async move {
            Ok::<_, String>(format!("todo {}", id))
        })
        .build()
        .unwrap();
    let _ = query.refetch().await;

    let cache = query.clone();
    let rename = MutationOptions::new(|title: String| async move { Ok::<_, String>(title) })
        .on_success(move |title| cache.set_data(title.clone()))
        .build();

    assert_eq!(rename.mutate("renamed".to_string()).await.as_deref(), Some("renamed"));
    assert_eq!(query.data().as_deref(), Some("renamed"));
}
