//! Tests for keeping query caches in sync over a broadcast channel.

#![cfg(feature = "broadcast")]

use std::time::Duration;

use query_cache::{
    BroadcastHub, BroadcastMessage, BroadcastOptions, BroadcastQuery, CacheStore, Query,
    QueryOptions, QueryState, Signal, Transport,
};

type TodoQuery = Query<u32, String, String>;
type Message = BroadcastMessage<u32, String, String>;

const WAIT: Duration = Duration::from_secs(5);

/// A query that never fetches on its own, so only explicit writes and peers
/// change its cache.
fn idle_query() -> TodoQuery {
    QueryOptions::new(Signal::new(1u32), |id: u32| async move {
        Ok::<_, String>(format!("todo {}", id))
    })
    .enabled(Signal::new(false))
    .build()
    .unwrap()
}

async fn wait_for_data(query: &TodoQuery, key: u32, expected: &str) {
    let wait = query.store().wait_for(|cache| {
        cache.get(&key).and_then(|entry| entry.data.as_deref()) == Some(expected)
    });
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("peer change never arrived");
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test]
async fn test_set_cache_reaches_peer_without_echo() {
    let hub = BroadcastHub::new();
    let spy = hub.open("todos");
    let a = idle_query();
    let b = idle_query();
    let _sync_a = BroadcastQuery::join(
        a.store(),
        &hub,
        BroadcastOptions::new("todos").initialize(false),
    )
    .unwrap();
    let _sync_b = BroadcastQuery::join(
        b.store(),
        &hub,
        BroadcastOptions::new("todos").initialize(false),
    )
    .unwrap();

    a.set_cache(|cache| {
        cache.insert(1, QueryState::with_data("from a".to_string()));
    });
    wait_for_data(&b, 1, "from a").await;

    // Exactly one SET went out: A's. B applied it silently.
    let raw = tokio::time::timeout(WAIT, spy.recv()).await.unwrap().unwrap();
    assert!(matches!(Message::decode(&raw).unwrap(), Message::Set { .. }));
    let echo = tokio::time::timeout(Duration::from_millis(100), spy.recv()).await;
    assert!(echo.is_err(), "unexpected message {:?}", echo);
}

#[tokio::test]
async fn test_writes_flow_both_ways() {
    let hub = BroadcastHub::new();
    let a = idle_query();
    let b = idle_query();
    let _sync_a = BroadcastQuery::join(a.store(), &hub, BroadcastOptions::new("todos")).unwrap();
    let _sync_b = BroadcastQuery::join(b.store(), &hub, BroadcastOptions::new("todos")).unwrap();

    a.set_data_for(1, "one".to_string());
    wait_for_data(&b, 1, "one").await;

    b.set_data_for(2, "two".to_string());
    wait_for_data(&a, 2, "two").await;

    assert_eq!(a.data_for(&1).as_deref(), Some("one"));
    assert_eq!(b.data_for(&2).as_deref(), Some("two"));
}

#[tokio::test]
async fn test_refetch_is_broadcast() {
    let hub = BroadcastHub::new();
    let fetching: TodoQuery = QueryOptions::new(Signal::new(3u32), |id: u32| async move {
        Ok::<_, String>(format!("todo {}", id))
    })
    .build()
    .unwrap();
    let mirror = idle_query();
    let _sync_mirror =
        BroadcastQuery::join(mirror.store(), &hub, BroadcastOptions::new("todos")).unwrap();
    let _sync_fetching =
        BroadcastQuery::join(fetching.store(), &hub, BroadcastOptions::new("todos")).unwrap();

    let _ = fetching.refetch().await;

    wait_for_data(&mirror, 3, "todo 3").await;
}

#[tokio::test]
async fn test_initialize_pulls_running_peer() {
    let hub = BroadcastHub::new();
    let running = idle_query();
    running.set_data_for(5, "five".to_string());
    let _sync_running =
        BroadcastQuery::join(running.store(), &hub, BroadcastOptions::new("todos")).unwrap();

    let joining = idle_query();
    let _sync_joining =
        BroadcastQuery::join(joining.store(), &hub, BroadcastOptions::new("todos")).unwrap();

    wait_for_data(&joining, 5, "five").await;
}

#[tokio::test]
async fn test_channels_are_separate() {
    let hub = BroadcastHub::new();
    let a = idle_query();
    let b = idle_query();
    let _sync_a = BroadcastQuery::join(a.store(), &hub, BroadcastOptions::new("one")).unwrap();
    let _sync_b = BroadcastQuery::join(b.store(), &hub, BroadcastOptions::new("two")).unwrap();

    a.set_data_for(1, "only a".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(b.entry_for(&1).is_none());
}

#[tokio::test]
async fn test_dropped_sync_stops_replication() {
    let hub = BroadcastHub::new();
    let a = idle_query();
    let b = CacheStore::<u32, String, String>::new();
    let sync_a = BroadcastQuery::join(a.store(), &hub, BroadcastOptions::new("todos")).unwrap();
    let _sync_b = BroadcastQuery::join(&b, &hub, BroadcastOptions::new("todos")).unwrap();
    assert_eq!(sync_a.channel(), "todos");

    drop(sync_a);
    a.set_data_for(1, "lost".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(b.get(&1).is_none());
}
