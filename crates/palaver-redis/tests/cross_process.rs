// Two engine instances sharing one Redis must behave as one logical backend.
mod common;

use anyhow::Result;
use palaver_common::Message;
use palaver_redis::{ConnectionPool, Keys, SubscriptionManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn subscriptions_are_visible_across_instances() -> Result<()> {
    let config = common::test_config();
    let keys = Keys::new(config.namespace.clone());

    let manager_a = SubscriptionManager::new(
        Arc::new(ConnectionPool::new(&config)?),
        keys.clone(),
        config.subscription_ttl,
        config.effective_cleanup_batch_size(),
    );
    let manager_b = SubscriptionManager::new(
        Arc::new(ConnectionPool::new(&config)?),
        keys,
        config.subscription_ttl,
        config.effective_cleanup_batch_size(),
    );

    manager_a.subscribe("c1", "/m").await?;
    let seen = manager_b.subscribers("/m").await?;
    assert_eq!(seen, vec!["c1".to_string()]);

    manager_a.subscribe("c2", "/chat/**").await?;
    let seen = manager_b.subscribers("/chat/lobby").await?;
    assert_eq!(seen, vec!["c2".to_string()]);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn publish_on_one_engine_reaches_clients_of_another() -> Result<()> {
    let config = common::test_config();
    let engine_a = common::engine(&config).await;
    let engine_b = common::engine(&config).await;

    let client = engine_a.create_client().await.expect("client");
    assert!(engine_a.subscribe(&client, "/m").await);

    assert!(
        engine_b
            .publish(Message::new("/m", json!("from-b")), &["/m".to_string()])
            .await
    );

    let delivered = common::eventually(Duration::from_secs(3), || {
        let engine_a = Arc::clone(&engine_a);
        let client = client.clone();
        async move { !engine_a.empty_queue(&client).await.is_empty() }
    })
    .await;
    assert!(delivered);

    engine_a.disconnect().await;
    engine_b.disconnect().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local Redis server"]
async fn pings_keep_a_client_alive_across_instances() -> Result<()> {
    let mut config = common::test_config();
    config.client_timeout = 2;
    let engine_a = common::engine(&config).await;
    let engine_b = common::engine(&config).await;

    let client = engine_a.create_client().await.expect("client");
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine_b.ping(&client).await;
    }
    // Three seconds elapsed against a two-second timeout; the heartbeats
    // from the other instance kept the session alive.
    assert!(engine_a.client_exists(&client).await);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!engine_a.client_exists(&client).await);

    engine_a.disconnect().await;
    engine_b.disconnect().await;
    Ok(())
}
