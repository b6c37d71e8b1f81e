// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the shutdown and archive workflows.

mod common;

use chrono::Utc;
use cloudenv_core::{ActivationOutcome, IdentityScope, OperationState, ResourceType};
use cloudenv_environment::handlers::{
    ARCHIVE_POLL_RETRY, ArchivePhase, ShutdownPhase, WorkflowInput, reasons,
};
use cloudenv_environment::mock::MockResourceBroker;
use cloudenv_environment::providers::BrokerOperationStatus;
use cloudenv_environment::{CloudEnvironment, EnvironmentOperation, EnvironmentState, EnvironmentTarget};
use common::{ARCHIVE_AFTER, finished, harness, harness_with};

fn shutdown_input(env: &CloudEnvironment) -> WorkflowInput<ShutdownPhase> {
    WorkflowInput::new(env.id, "IdleTimeout", env.last_state_updated)
}

fn archive_input(env: &CloudEnvironment) -> WorkflowInput<ArchivePhase> {
    WorkflowInput::new(env.id, "ScheduledArchival", env.last_state_updated)
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_compute_and_schedules_archival() {
    let h = harness();
    let env = h.available_environment().await;
    let compute = env.compute.clone().unwrap();
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    let before = Utc::now();
    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ShutdownEnvironment),
        Some((OperationState::Succeeded, None))
    );
    let phases: Vec<_> = steps.iter().filter_map(|s| s.phase()).collect();
    assert_eq!(
        phases,
        vec![
            "check_compute_cleanup_status",
            "compute_delete",
            "check_compute_delete_status",
            "mark_shutdown",
        ]
    );

    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Shutdown);
    assert!(stored.compute.is_none());
    assert!(stored.storage.is_some());
    let archival = stored.scheduled_archival.unwrap();
    let after = chrono::Duration::from_std(ARCHIVE_AFTER).unwrap();
    assert!(archival >= before + after);
    assert!(!h.mocks.broker.exists(compute.resource_id).await);
    assert_eq!(
        stored.transition(EnvironmentOperation::ShuttingDown).map(|t| t.status),
        Some(OperationState::Succeeded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_vm_cleanup() {
    let h = harness();
    let env = h.available_environment().await;
    let compute = env.compute.clone().unwrap();
    h.mocks
        .broker
        .set_cleanup(compute.resource_id, Some(BrokerOperationStatus::InProgress))
        .await;
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    h.step().await.unwrap();
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::ShuttingDown);
    assert!(h.mocks.broker.exists(compute.resource_id).await);
    assert_eq!(h.mocks.broker.delete_calls().await, 0);

    h.mocks
        .broker
        .set_cleanup(compute.resource_id, Some(BrokerOperationStatus::Succeeded))
        .await;
    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ShutdownEnvironment),
        Some((OperationState::Succeeded, None))
    );
    assert!(!h.mocks.broker.exists(compute.resource_id).await);
}

#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_skips_in_vm_cleanup() {
    let h = harness();
    let env = h.available_environment().await;
    let compute = env.compute.clone().unwrap();
    h.mocks
        .broker
        .set_cleanup(compute.resource_id, Some(BrokerOperationStatus::InProgress))
        .await;
    h.submit(
        EnvironmentTarget::ShutdownEnvironment,
        &shutdown_input(&env).forced(),
    )
    .await;

    let steps = h.drain(20).await;

    // compute_delete, check_compute_delete_status, mark_shutdown
    assert_eq!(steps.len(), 3);
    assert_eq!(
        finished(&steps, EnvironmentTarget::ShutdownEnvironment),
        Some((OperationState::Succeeded, None))
    );
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_compute_marks_shutdown_at_once() {
    let h = harness();
    let mut env = h.shutdown_environment().await;
    env.state = EnvironmentState::Available;
    let env = h.mocks.repository.insert(env).await;
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].completed(), Some((OperationState::Succeeded, None)));
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::Shutdown);
    assert_eq!(h.mocks.broker.delete_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_final_write_fails_the_shutdown() {
    let h = harness();
    let mut env = h.shutdown_environment().await;
    env.state = EnvironmentState::Available;
    let env = h.mocks.repository.insert(env).await;
    h.mocks.repository.fail_next_updates(1);
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        steps[0].completed(),
        Some((
            OperationState::Failed,
            Some(reasons::FAILED_TO_UPDATE_ENVIRONMENT_RECORD.to_string())
        ))
    );
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::Available);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_compute_delete_fails_the_shutdown() {
    let h = harness();
    let env = h.available_environment().await;
    let compute = env.compute.clone().unwrap();
    h.mocks.broker.reject_delete(compute.resource_id).await;
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ShutdownEnvironment),
        Some((
            OperationState::Failed,
            Some(reasons::FAILED_COMPUTE_DELETE.to_string())
        ))
    );
    assert!(h.stored(env.id).await.compute.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_of_deleted_environment_is_cancelled() {
    let h = harness();
    let mut env = h.environment().await;
    env.state = EnvironmentState::Deleted;
    let env = h.mocks.repository.insert(env).await;
    h.submit(EnvironmentTarget::ShutdownEnvironment, &shutdown_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        steps[0].completed(),
        Some((
            OperationState::Cancelled,
            Some(reasons::INVALID_ENVIRONMENT_STATE.to_string())
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_archive_swaps_storage_to_archive_blob() {
    let h = harness();
    let mut env = h.shutdown_environment().await;
    env.scheduled_archival = Some(Utc::now());
    let env = h.mocks.repository.insert(env).await;
    let file_share = env.storage.clone().unwrap();
    h.submit(EnvironmentTarget::ArchiveEnvironment, &archive_input(&env))
        .await;

    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ArchiveEnvironment),
        Some((OperationState::Succeeded, None))
    );
    let phases: Vec<_> = steps.iter().filter_map(|s| s.phase()).collect();
    assert_eq!(
        phases,
        vec![
            "allocate_storage_blob",
            "start_storage_blob",
            "check_start_storage_blob",
            "cleanup_unneeded_storage",
        ]
    );

    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Archived);
    assert_eq!(
        stored.storage.as_ref().map(|s| s.resource_type),
        Some(ResourceType::StorageArchive)
    );
    assert!(stored.pending_archive.is_none());
    assert!(stored.scheduled_archival.is_none());
    assert!(!h.mocks.broker.exists(file_share.resource_id).await);
    assert_eq!(
        stored.transition(EnvironmentOperation::Archiving).map(|t| t.status),
        Some(OperationState::Succeeded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_archive_is_cancelled_when_environment_changed() {
    let h = harness();
    let env = h.shutdown_environment().await;
    let mut input = archive_input(&env);
    input.last_state_updated = env.last_state_updated - chrono::Duration::hours(1);
    h.submit(EnvironmentTarget::ArchiveEnvironment, &input).await;

    let steps = h.drain(10).await;

    assert_eq!(
        steps[0].completed(),
        Some((
            OperationState::Cancelled,
            Some(reasons::ENVIRONMENT_STATE_CHANGED.to_string())
        ))
    );
    assert_eq!(h.mocks.broker.allocate_calls().await, 0);
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_failed_archive_copy_releases_the_blob() {
    let mut broker = MockResourceBroker::new();
    broker.start_outcome = BrokerOperationStatus::Failed;
    let h = harness_with(broker);
    let env = h.shutdown_environment().await;
    let file_share = env.storage.clone().unwrap();
    h.submit(EnvironmentTarget::ArchiveEnvironment, &archive_input(&env))
        .await;

    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ArchiveEnvironment),
        Some((
            OperationState::Failed,
            Some(reasons::INVALID_BLOB_STORAGE_START_STATUS.to_string())
        ))
    );
    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Shutdown);
    assert!(stored.pending_archive.is_none());
    assert!(stored.storage.as_ref().unwrap().same_resource(&file_share));
    assert!(h.mocks.broker.exists(file_share.resource_id).await);
    assert_eq!(h.mocks.broker.deleted().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_long_archive_copy_runs_until_its_budget_times_out() {
    let mut broker = MockResourceBroker::new();
    broker.start_outcome = BrokerOperationStatus::InProgress;
    let h = harness_with(broker);
    let env = h.shutdown_environment().await;
    h.submit(EnvironmentTarget::ArchiveEnvironment, &archive_input(&env))
        .await;

    // allocate_storage_blob, start_storage_blob
    h.step().await.unwrap();
    h.step().await.unwrap();
    tokio::time::advance(ARCHIVE_POLL_RETRY).await;

    // An hour into the copy the workflow is still polling.
    let mut polling = h.take_next().await;
    assert_eq!(polling.input["current_state"], "check_start_storage_blob");
    polling.created = Utc::now() - chrono::Duration::minutes(61);
    let outcome = h
        .activator
        .activate(&polling, &IdentityScope::default())
        .await
        .unwrap();
    assert!(matches!(outcome, ActivationOutcome::Requeued { .. }));
    assert!(h.stored(env.id).await.pending_archive.is_some());

    // Past the four hour budget the copy times out and the blob is released.
    tokio::time::advance(ARCHIVE_POLL_RETRY).await;
    let mut stalled = h.take_next().await;
    stalled.created = Utc::now() - chrono::Duration::minutes(4 * 60 + 10);
    stalled.input["phase_entered_at"] =
        serde_json::to_value(Utc::now() - chrono::Duration::minutes(4 * 60 + 5)).unwrap();
    let outcome = h
        .activator
        .activate(&stalled, &IdentityScope::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ActivationOutcome::Completed { status: OperationState::Failed, ref error_reason }
            if error_reason.as_deref() == Some(reasons::TIMEOUT)
    ));

    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Shutdown);
    assert!(stored.pending_archive.is_none());
    assert_eq!(
        stored.transition(EnvironmentOperation::Archiving).map(|t| t.status),
        Some(OperationState::Failed)
    );
    assert_eq!(h.mocks.broker.deleted().await.len(), 1);
}
