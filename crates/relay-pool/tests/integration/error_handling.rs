//! Error handling and edge case tests

use super::*;
use relay_pool::{ConnectionPool, ErrorKind, Filter, RelayConnection, RelayStatus};

#[tokio::test]
async fn test_invalid_relay_urls() {
    let pool = ConnectionPool::new();

    for url in ["", "   ", "http://relay.example.com", "wss://"] {
        let err = pool.add_relay_url(url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl, "url {url:?}");
    }
    assert!(pool.relays().await.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn test_unreachable_relay_not_added() {
    let pool = ConnectionPool::new();

    let result = timeout(WAIT, pool.add_relay_url(&unreachable_relay_url())).await;
    let err = result.expect("connect should fail fast").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert!(err.is_connection_failure());
    assert!(pool.relays().await.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn test_duplicate_subscription_id() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::new();
    pool.add_relay_url(&relay.url()).await.unwrap();

    let _sub = pool.new_sub("dup", Filter::new()).await.unwrap();
    let err = pool.new_sub("dup", Filter::new().kinds(vec![7])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubscriptionAlreadyExist);

    // Only the first REQ reached the relay
    relay.wait_for_frame(|f| f[0] == "REQ").await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.count("REQ", "dup"), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_operations_after_close() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::new();
    pool.close().await;
    assert!(pool.is_closed());

    let err = pool.add_relay_url(&relay.url()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);
    let err = pool.new_sub("late", Filter::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);

    // Closing again and closing unknown subscriptions are no-ops
    pool.close_sub("late").await;
    pool.close().await;
}

#[tokio::test]
async fn test_garbage_frames_are_ignored() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::new();
    pool.add_relay_url(&relay.url()).await.unwrap();

    let mut sub = pool.new_sub("robust", Filter::new()).await.unwrap();
    next_event(&mut sub).await;

    relay.push("not json");
    relay.push(r#"["UNKNOWN","robust"]"#);
    relay.push(r#"["EVENT","robust"]"#);
    relay.push(json!(["NOTICE", "hello"]).to_string());
    relay.push(json!(["EVENT", "someone-else", event_json("stray")]).to_string());
    relay.push_event("robust", "after-garbage");

    assert_eq!(next_event(&mut sub).await.1, "after-garbage");
    assert_eq!(pool.connected_count().await, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_relay_connection_lifecycle() {
    let relay = TestRelay::start().await;

    let conn = RelayConnection::new(&relay.url()).unwrap();
    conn.until_open().await.unwrap();
    assert!(conn.is_open());

    let mut messages = conn.subscribe_messages();
    conn.subscribe("direct", vec![Filter::new()]).unwrap();
    let first = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.subscription_id(), Some("direct"));

    conn.close().await;
    assert_eq!(conn.status(), RelayStatus::ClosedLocal);
    let err = conn.unsubscribe("direct").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOpen);
}

#[tokio::test]
async fn test_relay_connection_unreachable() {
    let conn = RelayConnection::new(&unreachable_relay_url()).unwrap();

    let err = timeout(WAIT, conn.until_open()).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert_eq!(conn.status(), RelayStatus::ClosedRemote);

    let err = conn.subscribe("nope", vec![Filter::new()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOpen);
}
