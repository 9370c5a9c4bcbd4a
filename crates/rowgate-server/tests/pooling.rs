//! Pooled sessions under contention, exhaustion and pool disabling.

use std::sync::Arc;
use std::time::Duration;

use rowgate_core::config::AdminConfig;
use rowgate_core::memory::MemoryDatabase;
use rowgate_core::{ConnectionRequest, Entity, PoolConfig, ServerConfig, User};
use rowgate_server::{EntityServer, ServerAdmin};
use tokio::time::Instant;

fn config(maximum_size: usize, checkout_timeout_ms: u64) -> ServerConfig {
    ServerConfig {
        client_logging_enabled: true,
        admin: Some(AdminConfig {
            username: "admin".into(),
            password: "secret".into(),
        }),
        pools: vec![PoolConfig {
            username: "scott".into(),
            password: "tiger".into(),
            minimum_size: 0,
            maximum_size,
            checkout_timeout_ms,
            ..PoolConfig::default()
        }],
        ..ServerConfig::default()
    }
}

async fn start(db: &MemoryDatabase, config: ServerConfig) -> (Arc<EntityServer>, ServerAdmin) {
    let server = EntityServer::start(config, Arc::new(db.factory()))
        .await
        .unwrap();
    let admin = server.admin(&User::new("admin", "secret")).unwrap();
    (server, admin)
}

fn scott() -> ConnectionRequest {
    ConnectionRequest::new(User::new("scott", "tiger"), "desktop")
}

#[tokio::test(start_paused = true)]
async fn third_checkout_waits_for_a_checkin() {
    let db = MemoryDatabase::new();
    let (server, admin) = start(&db, config(2, 2000)).await;
    db.set_latency(Duration::from_millis(500));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let session = server.connect(scott()).await.unwrap();
        handles.push(tokio::spawn(async move {
            let started = Instant::now();
            session.select_all("emp").await.unwrap();
            (session, started.elapsed())
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results.sort_by_key(|(_, elapsed)| *elapsed);

    let (waiter, elapsed) = &results[2];
    // 500 ms waiting for a checkin plus 500 ms of work.
    assert!(*elapsed >= Duration::from_millis(1000), "elapsed = {elapsed:?}");
    assert!(*elapsed < Duration::from_millis(2500), "elapsed = {elapsed:?}");

    let log = waiter.client_log();
    let get_connection = &log.entries[0].children()[0];
    assert_eq!(get_connection.method(), "getConnection");
    assert!(get_connection.message().unwrap().starts_with("retries: "));

    let stats = admin.pool_statistics("scott", 0).await.unwrap();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.delayed_requests, 1);
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_fails_the_call_only() {
    let db = MemoryDatabase::new();
    let (server, admin) = start(&db, config(1, 200)).await;
    db.set_latency(Duration::from_secs(1));

    let busy = server.connect(scott()).await.unwrap();
    let waiting = server.connect(scott()).await.unwrap();
    let running = {
        let busy = Arc::clone(&busy);
        tokio::spawn(async move { busy.select_all("emp").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let err = waiting.select_all("emp").await.unwrap_err();
    assert_eq!(err.kind(), "pool_exhausted");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(waiting.is_connected());

    running.await.unwrap().unwrap();
    db.set_latency(Duration::ZERO);
    waiting.select_all("emp").await.unwrap();

    let stats = admin.pool_statistics("scott", 0).await.unwrap();
    assert_eq!(stats.failed_requests, 1);
    assert!(stats.size <= 1);
    server.shutdown().await;
}

#[tokio::test]
async fn disabled_pool_hands_out_dedicated_connections() {
    let db = MemoryDatabase::new();
    let (server, admin) = start(&db, config(2, 2000)).await;

    let pinned = server.connect(scott()).await.unwrap();
    pinned.begin_transaction().await.unwrap();
    assert_eq!(db.connections_opened(), 1);

    admin.set_pool_enabled("scott", false).await.unwrap();

    // New sessions get their own connection at connect time.
    let dedicated = server.connect(scott()).await.unwrap();
    assert_eq!(db.connections_opened(), 2);
    dedicated
        .insert(vec![Entity::new("dept").with_key("deptno", 10).with_value("dname", "ACCOUNTING")])
        .await
        .unwrap();

    // The checked-out pooled connection keeps working until returned.
    pinned
        .insert(vec![Entity::new("dept").with_key("deptno", 20).with_value("dname", "RESEARCH")])
        .await
        .unwrap();
    pinned.commit_transaction().await.unwrap();
    assert_eq!(db.row_count("dept"), 2);

    let stats = admin.pool_statistics("scott", 0).await.unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);
    server.shutdown().await;
}
