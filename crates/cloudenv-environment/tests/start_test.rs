// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the resume and export workflows.

mod common;

use chrono::Utc;
use cloudenv_core::{OperationState, ResourceType};
use cloudenv_environment::handlers::{StartPhase, WorkflowInput, reasons};
use cloudenv_environment::mock::MockResourceBroker;
use cloudenv_environment::providers::{BrokerOperationStatus, ResourceBroker};
use cloudenv_environment::{CloudEnvironment, EnvironmentOperation, EnvironmentState, EnvironmentTarget};
use common::{finished, harness, harness_with};

fn start_input(env: &CloudEnvironment) -> WorkflowInput<StartPhase> {
    WorkflowInput::new(env.id, "UserRequested", env.last_state_updated)
}

#[tokio::test(start_paused = true)]
async fn test_resume_boots_a_shutdown_environment() {
    let h = harness();
    let mut env = h.shutdown_environment().await;
    env.scheduled_archival = Some(Utc::now() + chrono::Duration::days(7));
    let env = h.mocks.repository.insert(env).await;
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::StartEnvironment),
        Some((OperationState::Succeeded, None))
    );
    let phases: Vec<_> = steps.iter().filter_map(|s| s.phase()).collect();
    assert_eq!(phases.first().map(String::as_str), Some("get_resource"));
    assert_eq!(phases.last().map(String::as_str), Some("get_heartbeat_record"));

    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Available);
    assert_eq!(
        stored.compute.as_ref().map(|c| c.resource_type),
        Some(ResourceType::ComputeVm)
    );
    assert!(stored.scheduled_archival.is_none());
    assert!(stored.heartbeat_id.is_some());
    assert!(stored.os_disk.as_ref().unwrap().same_resource(env.os_disk.as_ref().unwrap()));
    assert_eq!(
        stored.transition(EnvironmentOperation::Resuming).map(|t| t.status),
        Some(OperationState::Succeeded)
    );
    assert_eq!(h.mocks.broker.allocate_calls().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_of_running_environment_is_a_no_op() {
    let h = harness();
    let env = h.available_environment().await;
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].completed(), Some((OperationState::Succeeded, None)));
    assert_eq!(h.mocks.broker.allocate_calls().await, 0);
    assert_eq!(h.mocks.broker.start_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_export_leaves_environment_exporting() {
    let h = harness();
    let env = h.shutdown_environment().await;
    h.submit(EnvironmentTarget::ExportEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::ExportEnvironment),
        Some((OperationState::Succeeded, None))
    );
    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Exporting);
    assert_eq!(
        stored.transition(EnvironmentOperation::Exporting).map(|t| t.status),
        Some(OperationState::Succeeded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_storage_fails_the_start() {
    let h = harness();
    let env = h.shutdown_environment().await;
    let storage = env.storage.clone().unwrap();
    h.mocks
        .broker
        .delete(env.id, storage.resource_id)
        .await
        .unwrap();
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::StartEnvironment),
        Some((
            OperationState::Failed,
            Some(reasons::FAILED_TO_GET_STORAGE_RESOURCE.to_string())
        ))
    );
    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Shutdown);
    assert!(stored.compute.is_none());
    assert_eq!(h.mocks.broker.allocate_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_boot_releases_compute() {
    let mut broker = MockResourceBroker::new();
    broker.start_outcome = BrokerOperationStatus::Failed;
    let h = harness_with(broker);
    let env = h.shutdown_environment().await;
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(20).await;

    assert_eq!(
        finished(&steps, EnvironmentTarget::StartEnvironment),
        Some((
            OperationState::Failed,
            Some(reasons::INVALID_START_COMPUTE_STATE.to_string())
        ))
    );
    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Shutdown);
    assert!(stored.compute.is_none());

    let deleted = h.mocks.broker.deleted().await;
    assert_eq!(deleted.len(), 1);
    assert!(!deleted.contains(&env.storage.as_ref().unwrap().resource_id));
    assert!(h.mocks.broker.exists(env.storage.as_ref().unwrap().resource_id).await);
}

#[tokio::test(start_paused = true)]
async fn test_start_of_failed_environment_is_refused() {
    let h = harness();
    let mut env = h.shutdown_environment().await;
    env.state = EnvironmentState::Failed;
    let env = h.mocks.repository.insert(env).await;
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        steps[0].completed(),
        Some((
            OperationState::Failed,
            Some(reasons::FAILED_ENVIRONMENT_START_STATE.to_string())
        ))
    );
    assert_eq!(h.stored(env.id).await.state, EnvironmentState::Failed);
    assert_eq!(h.mocks.broker.allocate_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_start_keeps_compute_of_unavailable_environment() {
    let h = harness();
    let mut env = h.available_environment().await;
    env.state = EnvironmentState::Unavailable;
    let env = h.mocks.repository.insert(env).await;
    let compute = env.compute.clone().unwrap();
    h.submit(EnvironmentTarget::StartEnvironment, &start_input(&env))
        .await;

    let steps = h.drain(10).await;

    assert_eq!(
        steps[0].completed(),
        Some((
            OperationState::Failed,
            Some(reasons::FAILED_ENVIRONMENT_START_STATE.to_string())
        ))
    );
    let stored = h.stored(env.id).await;
    assert_eq!(stored.state, EnvironmentState::Unavailable);
    assert!(stored.compute.as_ref().unwrap().same_resource(&compute));
    assert!(h.mocks.broker.exists(compute.resource_id).await);
    assert_eq!(h.mocks.broker.delete_calls().await, 0);
}
