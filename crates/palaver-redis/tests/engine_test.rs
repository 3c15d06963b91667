// End-to-end engine behavior against a live Redis. Run with:
//   cargo test -- --ignored
mod common;

use anyhow::Result;
use palaver_common::Message;
use redis::AsyncCommands;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn round_trip_through_the_queue() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/m").await);
    assert!(
        engine
            .publish(Message::new("/m", json!("hi")), &["/m".to_string()])
            .await
    );

    let inbox = engine.empty_queue(&client).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].data, json!("hi"));
    // Drained means drained.
    assert!(engine.empty_queue(&client).await.is_empty());

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn multi_channel_publish_counts() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let c1 = engine.create_client().await.expect("c1");
    let c2 = engine.create_client().await.expect("c2");
    for channel in ["/a", "/b"] {
        assert!(engine.subscribe(&c1, channel).await);
    }
    for channel in ["/b", "/c"] {
        assert!(engine.subscribe(&c2, channel).await);
    }

    let channels: Vec<String> = ["/a", "/b", "/c"].iter().map(|s| s.to_string()).collect();
    assert!(
        engine
            .publish(Message::new("/a", json!({"n": 1})), &channels)
            .await
    );

    // Give the pub/sub echo a moment to come back; it must be deduplicated.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.empty_queue(&c1).await.len(), 2);
    assert_eq!(engine.empty_queue(&c2).await.len(), 2);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn wildcard_subscription_delivers_nested_channels() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/chat/**").await);

    assert!(
        engine
            .publish(
                Message::new("/chat/r1/private", json!("psst")),
                &["/chat/r1/private".to_string()],
            )
            .await
    );
    assert!(
        engine
            .publish(Message::new("/other", json!("nope")), &["/other".to_string()])
            .await
    );

    let inbox = engine.empty_queue(&client).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].channel, "/chat/r1/private");

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn self_echo_enqueues_exactly_once() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/m").await);

    // First publish warms the lazy subscriber worker up.
    assert!(
        engine
            .publish(Message::new("/m", json!(1)), &["/m".to_string()])
            .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        engine
            .publish(Message::new("/m", json!(2)), &["/m".to_string()])
            .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    // One enqueue per publish: the echo coming back over pub/sub is dropped.
    assert_eq!(engine.empty_queue(&client).await.len(), 2);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn fifo_order_is_preserved() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/m").await);
    for n in 0..5 {
        assert!(
            engine
                .publish(Message::new("/m", json!(n)), &["/m".to_string()])
                .await
        );
    }

    let inbox = engine.empty_queue(&client).await;
    let order: Vec<_> = inbox.iter().map(|m| m.data.clone()).collect();
    assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn destroy_client_clears_every_trace() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/x").await);
    assert!(
        engine
            .publish(Message::new("/x", json!("queued")), &["/x".to_string()])
            .await
    );

    assert!(engine.destroy_client(&client).await);
    assert!(!engine.client_exists(&client).await);
    assert!(engine.empty_queue(&client).await.is_empty());

    let mut conn = common::raw_connection(&config).await;
    let ns = &config.namespace;
    let has_subscriptions: bool = conn.exists(format!("{ns}:subscriptions:{client}")).await?;
    assert!(!has_subscriptions);
    let still_member: bool = conn
        .sismember(format!("{ns}:channels:/x"), &client)
        .await?;
    assert!(!still_member);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn subscription_graph_stays_symmetric() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/a/b").await);

    let mut conn = common::raw_connection(&config).await;
    let ns = &config.namespace;
    let forward: bool = conn
        .sismember(format!("{ns}:subscriptions:{client}"), "/a/b")
        .await?;
    let backward: bool = conn
        .sismember(format!("{ns}:channels:/a/b"), &client)
        .await?;
    let record: bool = conn
        .exists(format!("{ns}:subscription:{client}:/a/b"))
        .await?;
    assert!(forward && backward && record);

    assert!(engine.unsubscribe(&client, "/a/b").await);
    let forward: bool = conn
        .sismember(format!("{ns}:subscriptions:{client}"), "/a/b")
        .await?;
    let record: bool = conn
        .exists(format!("{ns}:subscription:{client}:/a/b"))
        .await?;
    assert!(!forward && !record);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn orphaned_state_is_reclaimed() -> Result<()> {
    let config = common::test_config();
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/x").await);

    // Simulate a crashed front-end: the client record vanishes out-of-band
    // while its subscription state lingers.
    let mut conn = common::raw_connection(&config).await;
    let ns = &config.namespace;
    let _: () = conn.del(format!("{ns}:clients:{client}")).await?;
    let _: () = conn
        .srem(format!("{ns}:clients:index"), &client)
        .await?;

    engine.cleanup_expired().await;

    let has_subscriptions: bool = conn.exists(format!("{ns}:subscriptions:{client}")).await?;
    let has_record: bool = conn
        .exists(format!("{ns}:subscription:{client}:/x"))
        .await?;
    let still_member: bool = conn
        .sismember(format!("{ns}:channels:/x"), &client)
        .await?;
    assert!(!has_subscriptions && !has_record && !still_member);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn queue_ttl_is_armed_once() -> Result<()> {
    let mut config = common::test_config();
    config.message_ttl = 60;
    let engine = common::engine(&config).await;

    let client = engine.create_client().await.expect("client");
    assert!(engine.subscribe(&client, "/m").await);
    assert!(
        engine
            .publish(Message::new("/m", json!(1)), &["/m".to_string()])
            .await
    );

    let mut conn = common::raw_connection(&config).await;
    let queue_key = format!("{}:messages:{client}", config.namespace);
    let first_ttl: i64 = conn.ttl(&queue_key).await?;
    assert!(first_ttl > 0 && first_ttl <= 60);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        engine
            .publish(Message::new("/m", json!(2)), &["/m".to_string()])
            .await
    );
    let second_ttl: i64 = conn.ttl(&queue_key).await?;
    // A second enqueue must not rewind the clock that the first one started.
    assert!(second_ttl < first_ttl);

    engine.disconnect().await;
    Ok(())
}
