// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL environment and heartbeat repositories.

use chrono::Utc;
use cloudenv_core::Identity;
use cloudenv_environment::db::{PostgresEnvironmentRepository, PostgresHeartbeatRepository};
use cloudenv_environment::providers::{
    EnvironmentQuery, EnvironmentRepository, HeartbeatRepository, RepositoryError,
};
use cloudenv_environment::{CloudEnvironment, EnvironmentState};
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
    cloudenv_environment::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// An environment in a location no other test uses.
fn environment(owner: &str) -> CloudEnvironment {
    CloudEnvironment::new(owner, "dev", format!("test-{}", Uuid::new_v4()), "standard")
}

#[tokio::test]
async fn test_create_get_and_version_checked_update() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let repo = PostgresEnvironmentRepository::new(pool);
    let alice = Identity::user("alice");

    let created = repo.create(environment("alice"), &alice).await.unwrap();
    assert_eq!(created.version, 1);

    let mut loaded = repo.get(created.id, &alice).await.unwrap().unwrap();
    assert_eq!(loaded, created);

    loaded.set_state(EnvironmentState::Provisioning);
    let updated = repo.update(loaded, &alice).await.unwrap();
    assert_eq!(updated.version, 2);

    // Writing from the stale copy loses.
    let err = repo.update(created.clone(), &alice).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict { expected_version: 1, .. }));

    let stored = repo.get(created.id, &alice).await.unwrap().unwrap();
    assert_eq!(stored.state, EnvironmentState::Provisioning);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let repo = PostgresEnvironmentRepository::new(pool);
    let env = environment("alice");

    repo.create(env.clone(), &Identity::Superuser).await.unwrap();
    assert!(matches!(
        repo.create(env, &Identity::Superuser).await,
        Err(RepositoryError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_other_owners_are_forbidden() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let repo = PostgresEnvironmentRepository::new(pool);
    let created = repo
        .create(environment("alice"), &Identity::user("alice"))
        .await
        .unwrap();
    let bob = Identity::user("bob");

    assert!(matches!(
        repo.get(created.id, &bob).await,
        Err(RepositoryError::Forbidden(_))
    ));
    assert!(matches!(
        repo.update(created.clone(), &bob).await,
        Err(RepositoryError::Forbidden(_))
    ));
    assert!(
        repo.get(created.id, &Identity::Superuser)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_list_filters_due_archivals() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let repo = PostgresEnvironmentRepository::new(pool);
    let su = Identity::Superuser;

    let mut due = environment("alice");
    let location = due.location.clone();
    due.state = EnvironmentState::Shutdown;
    due.scheduled_archival = Some(Utc::now() - chrono::Duration::hours(1));
    let due = repo.create(due, &su).await.unwrap();

    let mut later = environment("alice");
    later.location = location.clone();
    later.state = EnvironmentState::Shutdown;
    later.scheduled_archival = Some(Utc::now() + chrono::Duration::days(1));
    repo.create(later, &su).await.unwrap();

    let mut running = environment("alice");
    running.location = location.clone();
    running.state = EnvironmentState::Available;
    repo.create(running, &su).await.unwrap();

    let query = EnvironmentQuery {
        state: Some(EnvironmentState::Shutdown),
        location: Some(location),
        archival_due_before: Some(Utc::now()),
        limit: Some(10),
        ..Default::default()
    };
    let found = repo.list(&query, &su).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, due.id);

    assert!(repo.list(&query, &Identity::user("bob")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_create_is_idempotent() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to get test pool");
    let heartbeats = PostgresHeartbeatRepository::new(pool);
    let environment_id = Uuid::new_v4();

    assert!(heartbeats.find(environment_id).await.unwrap().is_none());
    let first = heartbeats.create(environment_id).await.unwrap();
    let second = heartbeats.create(environment_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(heartbeats.find(environment_id).await.unwrap(), Some(first));
}
