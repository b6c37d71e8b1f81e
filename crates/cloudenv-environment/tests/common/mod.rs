// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for cloudenv-environment integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudenv_core::{
    ActivationOutcome, ContinuationActivator, ContinuationQueue, ContinuationQueuePayload,
    ContinuationSubmitter, Dispatcher, HandlerRegistry, Identity, IdentityScope, InMemoryQueue,
    OperationState, ResourceType, StaticRegionMap,
};
use cloudenv_environment::handlers;
use cloudenv_environment::mock::{MockCollaborators, MockResourceBroker};
use cloudenv_environment::{CloudEnvironment, EnvironmentState, EnvironmentTarget};
use serde::Serialize;
use uuid::Uuid;

pub const OWNER: &str = "alice";
pub const LOCATION: &str = "westus2";
pub const ARCHIVE_AFTER: Duration = Duration::from_secs(7 * 24 * 3600);

/// One activated step.
pub struct Step {
    pub payload: ContinuationQueuePayload<EnvironmentTarget>,
    pub outcome: ActivationOutcome,
}

impl Step {
    /// Phase name carried by the step's input, for multi-phase workflows.
    pub fn phase(&self) -> Option<String> {
        self.payload.input["current_state"]
            .as_str()
            .map(str::to_string)
    }

    pub fn completed(&self) -> Option<(OperationState, Option<String>)> {
        match &self.outcome {
            ActivationOutcome::Completed {
                status,
                error_reason,
            } => Some((*status, error_reason.clone())),
            _ => None,
        }
    }
}

pub struct Harness {
    pub mocks: MockCollaborators,
    pub queue: Arc<InMemoryQueue<EnvironmentTarget>>,
    pub activator: Arc<ContinuationActivator<EnvironmentTarget>>,
}

pub fn harness() -> Harness {
    harness_with(MockResourceBroker::new())
}

pub fn harness_with(broker: MockResourceBroker) -> Harness {
    let mocks = MockCollaborators::with_broker(broker);
    let queue = Arc::new(InMemoryQueue::new());
    let regions = Arc::new(StaticRegionMap::new(LOCATION).with_location(LOCATION, LOCATION));
    let submitter = ContinuationSubmitter::new(queue.clone(), regions);

    let registry = handlers::register_all(
        HandlerRegistry::builder(),
        &mocks.collaborators(),
        submitter.clone(),
        ARCHIVE_AFTER,
    )
    .build()
    .unwrap();
    let activator = Arc::new(ContinuationActivator::new(
        Dispatcher::new(Arc::new(registry)),
        submitter,
    ));

    Harness {
        mocks,
        queue,
        activator,
    }
}

impl Harness {
    /// Store a new environment owned by [`OWNER`].
    pub async fn environment(&self) -> CloudEnvironment {
        self.mocks
            .repository
            .insert(CloudEnvironment::new(OWNER, "dev", LOCATION, "standard"))
            .await
    }

    /// Store an environment that was shut down, with its disk and storage allocated.
    pub async fn shutdown_environment(&self) -> CloudEnvironment {
        let mut env = CloudEnvironment::new(OWNER, "dev", LOCATION, "standard");
        let refs = self
            .mocks
            .broker
            .allocate_now(env.id, &[ResourceType::OsDisk, ResourceType::StorageFileShare])
            .await;
        env.os_disk = Some(refs[0].clone());
        env.storage = Some(refs[1].clone());
        env.state = EnvironmentState::Shutdown;
        self.mocks.repository.insert(env).await
    }

    /// Store a running environment with compute, disk and storage.
    pub async fn available_environment(&self) -> CloudEnvironment {
        let mut env = CloudEnvironment::new(OWNER, "dev", LOCATION, "standard");
        let refs = self
            .mocks
            .broker
            .allocate_now(
                env.id,
                &[
                    ResourceType::ComputeVm,
                    ResourceType::OsDisk,
                    ResourceType::StorageFileShare,
                ],
            )
            .await;
        env.compute = Some(refs[0].clone());
        env.os_disk = Some(refs[1].clone());
        env.storage = Some(refs[2].clone());
        env.state = EnvironmentState::Available;
        self.mocks.repository.insert(env).await
    }

    pub async fn stored(&self, id: Uuid) -> CloudEnvironment {
        self.mocks.repository.snapshot(id).await.unwrap()
    }

    pub async fn submit<I: Serialize + Sync>(&self, target: EnvironmentTarget, input: &I) -> Uuid {
        self.activator
            .submitter()
            .submit_as(target, input, Identity::user(OWNER))
            .await
            .unwrap()
    }

    /// Pull the next visible payload and complete it without activating it.
    pub async fn take_next(&self) -> ContinuationQueuePayload<EnvironmentTarget> {
        let mut pulled = self.queue.pull(1, Duration::from_secs(30)).await.unwrap();
        let message = pulled.pop().unwrap();
        self.queue.complete(&message.receipt).await.unwrap();
        message.payload
    }

    /// Activate `payload` twice, as after a completion that was lost.
    pub async fn activate_twice(
        &self,
        payload: &ContinuationQueuePayload<EnvironmentTarget>,
    ) -> (ActivationOutcome, ActivationOutcome) {
        let scope = IdentityScope::default();
        let first = self.activator.activate(payload, &scope).await.unwrap();
        let second = self.activator.activate(payload, &scope).await.unwrap();
        (first, second)
    }

    /// Activate the next visible step, if any.
    pub async fn step(&self) -> Option<Step> {
        let mut pulled = self.queue.pull(1, Duration::from_secs(30)).await.unwrap();
        let message = pulled.pop()?;
        let outcome = self
            .activator
            .activate(&message.payload, &IdentityScope::default())
            .await
            .unwrap();
        self.queue.complete(&message.receipt).await.unwrap();
        Some(Step {
            payload: message.payload,
            outcome,
        })
    }

    /// Activate steps, skipping the clock over requested delays, until the queue is
    /// empty or `max_steps` ran. Needs a paused clock.
    pub async fn drain(&self, max_steps: usize) -> Vec<Step> {
        let mut steps = Vec::new();
        while steps.len() < max_steps {
            match self.step().await {
                Some(step) => steps.push(step),
                None => {
                    let next = self.queue.snapshot().await.into_iter().map(|(_, d)| d).min();
                    match next {
                        Some(delay) => tokio::time::advance(delay).await,
                        None => break,
                    }
                }
            }
        }
        steps
    }
}

/// How an activation was classified, comparable across redeliveries.
pub fn classification(outcome: &ActivationOutcome) -> String {
    match outcome {
        ActivationOutcome::Requeued { delay, .. } => format!("requeued after {delay:?}"),
        ActivationOutcome::Completed {
            status,
            error_reason,
        } => format!("{status} {error_reason:?}"),
        ActivationOutcome::Retrying { .. } => "retrying".to_string(),
        ActivationOutcome::Abandoned { .. } => "abandoned".to_string(),
    }
}

/// Payload for `input` as if submitted by [`OWNER`].
pub fn owner_payload<I: Serialize>(
    target: EnvironmentTarget,
    input: &I,
) -> ContinuationQueuePayload<EnvironmentTarget> {
    ContinuationQueuePayload::new(
        target,
        serde_json::to_value(input).unwrap(),
        Identity::user(OWNER),
    )
}

/// Terminal outcome of the last step for `target`.
pub fn finished(steps: &[Step], target: EnvironmentTarget) -> Option<(OperationState, Option<String>)> {
    steps
        .iter()
        .rev()
        .filter(|s| s.payload.target == target)
        .find_map(Step::completed)
}
