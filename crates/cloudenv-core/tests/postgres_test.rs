// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL queue and lease backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cloudenv_core::{
    ClaimedLease, ContinuationQueue, ContinuationQueuePayload, Identity, PostgresLease,
    PostgresQueue,
};
use common::Job;
use sqlx::PgPool;
use uuid::Uuid;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_CLOUDENV_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_CLOUDENV_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_CLOUDENV_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    cloudenv_core::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

fn payload(n: u32) -> ContinuationQueuePayload<Job> {
    ContinuationQueuePayload::new(
        Job::Countdown,
        serde_json::json!({ "remaining": n }),
        Identity::Superuser,
    )
}

#[tokio::test]
async fn test_postgres_queue_push_pull_complete() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let queue = PostgresQueue::<Job>::new(pool, format!("test-{}", Uuid::new_v4()));

    let sent = payload(3);
    queue.push(sent.clone(), Duration::ZERO).await.unwrap();

    let pulled = queue.pull(10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].payload.tracking_id, sent.tracking_id);
    assert_eq!(pulled[0].dequeue_count, 1);

    // Leased: invisible to a second consumer.
    assert!(queue.pull(10, Duration::from_secs(30)).await.unwrap().is_empty());

    assert!(queue.complete(&pulled[0].receipt).await.unwrap());
    assert!(!queue.complete(&pulled[0].receipt).await.unwrap());
}

#[tokio::test]
async fn test_postgres_queue_delay_hides_message() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let queue = PostgresQueue::<Job>::new(pool, format!("test-{}", Uuid::new_v4()));

    queue.push(payload(1), Duration::from_secs(3600)).await.unwrap();
    assert!(queue.pull(10, Duration::from_secs(30)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_postgres_queue_redelivers_after_visibility_timeout() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let queue = PostgresQueue::<Job>::new(pool, format!("test-{}", Uuid::new_v4()));

    queue.push(payload(1), Duration::ZERO).await.unwrap();
    let first = queue.pull(1, Duration::from_millis(200)).await.unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = queue.pull(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].dequeue_count, 2);
    assert!(!queue.complete(&first[0].receipt).await.unwrap());
    assert!(queue.complete(&second[0].receipt).await.unwrap());
}

#[tokio::test]
async fn test_postgres_lease_claim_once_per_window() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let lease = PostgresLease::new(pool);
    let name = format!("scan-{}", Uuid::new_v4());
    let day = Some(Duration::from_secs(24 * 3600));

    let guard = lease.obtain("tests", &name, day).await.unwrap().expect("first claim");
    assert!(lease.obtain("tests", &name, day).await.unwrap().is_none());
    guard.release().await.unwrap();

    // Released, but still claimed today.
    assert!(lease.obtain("tests", &name, day).await.unwrap().is_none());
    // Without a claim period a released lease is free again.
    let again = lease.obtain("tests", &name, None).await.unwrap();
    assert!(again.is_some());
    again.unwrap().release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_lease_concurrent_obtains_yield_one_guard() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let lease = Arc::new(PostgresLease::new(pool));
    let name = format!("scan-{}", Uuid::new_v4());
    let hour = Some(Duration::from_secs(3600));

    let contenders: Vec<_> = (0..8)
        .map(|_| {
            let lease = Arc::clone(&lease);
            let name = name.clone();
            tokio::spawn(async move { lease.obtain("tests", &name, hour).await })
        })
        .collect();
    let mut guards = Vec::new();
    for contender in contenders {
        if let Some(guard) = contender.await.unwrap().unwrap() {
            guards.push(guard);
        }
    }

    assert_eq!(guards.len(), 1);
    guards.pop().unwrap().release().await.unwrap();
}
