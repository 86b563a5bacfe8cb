//! Store and orchestration behaviour against a real Redis
//!
//! Requires Docker; run with `cargo test -- --ignored`.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use volmgr_common::{KvStore, Serial, SerialAllocator};
use volmgr_test::fixtures::commands;
use volmgr_test::{host, volume, Cluster, RedisTestEnv};

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_conditional_put_semantics() {
    let env = RedisTestEnv::start().await.expect("Failed to start Redis");
    let store = env.connect_store().await.expect("Failed to connect store");

    // Absent key: create succeeds once
    assert!(store.conditional_put("/volmgr/k", "1", None).await.unwrap());
    assert!(!store.conditional_put("/volmgr/k", "2", None).await.unwrap());
    assert_eq!(store.get("/volmgr/k").await.unwrap().as_deref(), Some("1"));

    // Swap only from the expected value
    assert!(!store.conditional_put("/volmgr/k", "3", Some("9")).await.unwrap());
    assert!(store.conditional_put("/volmgr/k", "3", Some("1")).await.unwrap());
    assert_eq!(env.get("/volmgr/k").await.unwrap().as_deref(), Some("3"));

    store.delete("/volmgr/k").await.unwrap();
    store.delete("/volmgr/k").await.unwrap();
    assert_eq!(store.get("/volmgr/k").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_allocator_continues_existing_counter() {
    let env = RedisTestEnv::start().await.expect("Failed to start Redis");
    env.set("/volmgr/serial", "41").await.expect("Failed to seed");

    let allocator = SerialAllocator::new(Arc::new(env.connect_store().await.unwrap()));
    assert_eq!(allocator.next_serial().await.unwrap(), Serial::new(42));
    assert_eq!(
        env.get("/volmgr/serial").await.unwrap().as_deref(),
        Some("42")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires Docker"]
async fn test_serials_distinct_across_connections() {
    let env = RedisTestEnv::start().await.expect("Failed to start Redis");

    let mut allocators = Vec::new();
    for _ in 0..4 {
        let store = env.connect_store().await.expect("Failed to connect store");
        allocators.push(SerialAllocator::new(Arc::new(store)));
    }

    let handles = allocators.into_iter().map(|allocator| {
        tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..25 {
                got.push(allocator.next_serial().await.unwrap());
            }
            got
        })
    });

    let mut seen = HashSet::new();
    for result in join_all(handles).await {
        for serial in result.unwrap() {
            assert!(seen.insert(serial), "serial {} handed out twice", serial);
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(
        env.get("/volmgr/serial").await.unwrap().as_deref(),
        Some("100")
    );
}

/// Scenario:
/// 1. Two instances with separate Redis connections publish one volume to two hosts
/// 2. Both hosts see the same serial
/// 3. The binding lives in Redis under the bindings prefix
#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_over_redis() {
    let env = RedisTestEnv::start().await.expect("Failed to start Redis");
    env.flush_all().await.expect("Failed to flush");

    let store: Arc<dyn KvStore> = Arc::new(env.connect_store().await.unwrap());
    let cluster = Cluster::with_store(store, 2);

    let first = cluster.instances[0]
        .publish(&volume("vol-a"), &host("host-1"))
        .await
        .unwrap();
    let second = cluster.instances[1]
        .publish(&volume("vol-a"), &host("host-2"))
        .await
        .unwrap();
    assert_eq!(first, second);

    assert_eq!(
        env.get("/volmgr/bindings/vol-a").await.unwrap(),
        Some(first.to_string())
    );
    assert_eq!(
        cluster.hypervisor.commands_for("host-2"),
        vec![
            commands::attach_backend("vol-a"),
            commands::attach_device("vol-a", first.get()),
        ]
    );

    cluster.instances[1]
        .unpublish(&volume("vol-a"), &host("host-2"))
        .await
        .unwrap();
    assert!(!cluster.hypervisor.has_drive("host-2", "vol-a"));
    assert!(cluster.hypervisor.has_device("host-1", "vol-a"));
}
