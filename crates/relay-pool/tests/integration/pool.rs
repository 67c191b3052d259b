//! Relay pool integration tests

use super::*;
use relay_pool::{ConnectionPool, ErrorKind, PoolConfig, RelayStatus};

#[tokio::test]
async fn test_pool_adds_relays_and_rejects_duplicates() {
    let relay_a = TestRelay::start().await;
    let relay_b = TestRelay::start().await;
    let pool = ConnectionPool::new();

    let conn = pool.add_relay_url(&relay_a.url()).await.unwrap();
    assert_eq!(conn.status(), RelayStatus::Open);
    pool.add_relay_url(&relay_b.url()).await.unwrap();
    assert_eq!(pool.connected_count().await, 2);

    // Same relay with a trailing slash is the same relay
    let err = pool
        .add_relay_url(&format!("{}/", relay_a.url()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RelayAlreadyRegistered);
    assert_eq!(pool.relays().await.len(), 2);

    assert!(pool.relay(&relay_b.url()).await.is_some());

    pool.close().await;
    assert!(pool.relays().await.is_empty());
    assert_eq!(conn.status(), RelayStatus::ClosedLocal);
}

#[tokio::test]
async fn test_add_relay_urls_reports_failures() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::new();

    let errors = pool
        .add_relay_urls([relay.url(), unreachable_relay_url()])
        .await
        .expect("unreachable relay should be reported");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, unreachable_relay_url());
    assert_eq!(errors[0].1.kind(), ErrorKind::ConnectFailed);

    let urls = pool.relay_urls().await;
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].as_str(), relay.url());

    pool.close().await;
}

#[tokio::test]
async fn test_remote_drop_is_tracked_until_reconnect() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::new();
    let conn = pool.add_relay_url(&relay.url()).await.unwrap();

    let mut sub = pool
        .new_sub("feed", relay_pool::Filter::new().kinds(vec![1]))
        .await
        .unwrap();
    assert_eq!(next_event(&mut sub).await.1, "stored");

    let mut status = conn.watch_status();
    relay.disconnect_all();
    timeout(WAIT, status.wait_for(|s| *s == RelayStatus::ClosedRemote))
        .await
        .unwrap()
        .unwrap();

    let dropped = pool.closed_relays_to_reconnect().await;
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].url(), conn.url());

    let fresh = pool.reconnect_relay(&relay.url()).await.unwrap();
    assert!(fresh.is_open());
    assert!(pool.closed_relays_to_reconnect().await.is_empty());

    // The subscription was replayed to the new connection
    assert_eq!(next_event(&mut sub).await.1, "stored");
    assert_eq!(relay.count("REQ", "feed"), 2);

    relay.push_event("feed", "live");
    assert_eq!(next_event(&mut sub).await.1, "live");

    pool.close().await;
}

#[tokio::test]
async fn test_reconnect_to_stopped_relay_fails() {
    let relay = TestRelay::start().await;
    let url = relay.url();
    let pool = ConnectionPool::new();
    let conn = pool.add_relay_url(&url).await.unwrap();

    let mut status = conn.watch_status();
    drop(relay);
    timeout(WAIT, status.wait_for(|s| *s == RelayStatus::ClosedRemote))
        .await
        .unwrap()
        .unwrap();

    let err = pool.reconnect_relay(&url).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);

    // Still registered and still waiting for a reconnect
    assert_eq!(pool.relays().await.len(), 1);
    assert_eq!(pool.closed_relays_to_reconnect().await.len(), 1);

    pool.close().await;
    assert!(pool.closed_relays_to_reconnect().await.is_empty());
}

#[tokio::test]
async fn test_auto_reconnect_restores_subscriptions() {
    let relay = TestRelay::start().await;
    let pool = ConnectionPool::with_config(PoolConfig {
        health_check_interval: Duration::from_millis(50),
        auto_reconnect: true,
        ..Default::default()
    });
    pool.add_relay_url(&relay.url()).await.unwrap();

    let mut sub = pool.new_sub("auto", relay_pool::Filter::new()).await.unwrap();
    assert_eq!(next_event(&mut sub).await.1, "stored");

    relay.disconnect_all();

    // The replayed REQ is answered with the stored event again
    assert_eq!(next_event(&mut sub).await.1, "stored");
    assert_eq!(relay.count("REQ", "auto"), 2);
    assert_eq!(pool.connected_count().await, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_publish_reaches_every_relay() {
    let relays = [TestRelay::start().await, TestRelay::start().await];
    let pool = ConnectionPool::new();
    assert!(
        pool.add_relay_urls(relays.iter().map(TestRelay::url))
            .await
            .is_none()
    );

    let event: relay_pool::Event = serde_json::from_value(event_json("hello")).unwrap();
    let results = pool.publish(event).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));

    for relay in &relays {
        let frame = relay.wait_for_frame(|f| f[0] == "EVENT").await;
        assert_eq!(frame[1]["content"], "hello");
    }

    pool.close().await;
}
