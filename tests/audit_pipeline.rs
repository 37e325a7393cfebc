mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use opshub::audit::{AuditEntry, AuditError, Subsystem, writer};
use opshub::config::AuditConfig;
use opshub::metrics::Metrics;

use helpers::test_env;

fn entry(action: &str) -> AuditEntry {
    AuditEntry::new(Subsystem::Host, "tester", action).resource("host", "h1")
}

async fn audit_count(db: &opshub::store::Db) -> i64 {
    sqlx::query_scalar(&db.sql("SELECT COUNT(*) FROM audit_events"))
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn batches_flush_on_timer() {
    let env = test_env().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let cfg = AuditConfig {
        channel_buffer: 64,
        batch_size: 50,
        flush_period_secs: 1,
        worker_count: 2,
        offer_timeout_ms: 100,
        shutdown_timeout_secs: 5,
    };
    let (logger, writer) = writer::spawn(env.state.db.clone(), &cfg, Arc::clone(&metrics));

    for i in 0..12 {
        logger.log(entry(&format!("act-{i}"))).await.unwrap();
    }

    // Far below batch_size, so only the 1s flush timer can drain these.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(audit_count(&env.state.db).await, 12);
    assert_eq!(metrics.audit_written_total.get(), 12);

    writer.shutdown().await;
}

#[tokio::test]
async fn batches_flush_when_full() {
    let env = test_env().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let cfg = AuditConfig {
        channel_buffer: 64,
        batch_size: 5,
        flush_period_secs: 60, // timer effectively disabled
        worker_count: 1,
        offer_timeout_ms: 100,
        shutdown_timeout_secs: 5,
    };
    let (logger, writer) = writer::spawn(env.state.db.clone(), &cfg, metrics);

    for i in 0..5 {
        logger.log(entry(&format!("full-{i}"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(audit_count(&env.state.db).await, 5);

    writer.shutdown().await;
}

#[tokio::test]
async fn overflow_returns_buffer_overflow_quickly() {
    let env = test_env().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let cfg = AuditConfig {
        channel_buffer: 4,
        batch_size: 50,
        flush_period_secs: 60,
        worker_count: 0, // blocked writer: nothing consumes
        offer_timeout_ms: 100,
        shutdown_timeout_secs: 1,
    };
    let (logger, writer) = writer::spawn(env.state.db.clone(), &cfg, Arc::clone(&metrics));

    let started = Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let logger = logger.clone();
        tasks.spawn(async move { logger.log(entry(&format!("burst-{i}"))).await });
    }

    let mut overflowed = 0;
    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(()) => accepted += 1,
            Err(AuditError::BufferOverflow) => overflowed += 1,
            Err(other) => panic!("unexpected audit error: {other}"),
        }
    }

    // Capacity 4 with no consumers: 4 accepted, 6 dropped, all callers
    // returned promptly and none panicked.
    assert_eq!(accepted, 4);
    assert_eq!(overflowed, 6);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(metrics.audit_overflow_total.get(), 6);

    writer.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_residual_entries() {
    let env = test_env().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let cfg = AuditConfig {
        channel_buffer: 64,
        batch_size: 50,
        flush_period_secs: 60,
        worker_count: 2,
        offer_timeout_ms: 100,
        shutdown_timeout_secs: 5,
    };
    let (logger, writer) = writer::spawn(env.state.db.clone(), &cfg, metrics);

    for i in 0..7 {
        logger.log(entry(&format!("drain-{i}"))).await.unwrap();
    }
    writer.shutdown().await;

    assert_eq!(audit_count(&env.state.db).await, 7);
}

#[tokio::test]
async fn worker_order_is_preserved_per_batch() {
    let env = test_env().await;
    let metrics = Arc::new(Metrics::new().unwrap());
    let cfg = AuditConfig {
        channel_buffer: 64,
        batch_size: 50,
        flush_period_secs: 60,
        worker_count: 1,
        offer_timeout_ms: 100,
        shutdown_timeout_secs: 5,
    };
    let (logger, writer) = writer::spawn(env.state.db.clone(), &cfg, metrics);

    for i in 0..5 {
        logger.log(entry(&format!("seq-{i}"))).await.unwrap();
    }
    writer.shutdown().await;

    let rows: Vec<String> = sqlx::query_scalar(&env.state.db.sql(
        "SELECT action FROM audit_events ORDER BY ts ASC, action ASC",
    ))
    .fetch_all(&env.state.db.pool)
    .await
    .unwrap();
    assert_eq!(rows, vec!["seq-0", "seq-1", "seq-2", "seq-3", "seq-4"]);
}
