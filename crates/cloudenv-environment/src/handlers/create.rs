// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Create: allocate, boot and start monitoring a new environment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudenv_core::{
    ContinuationResult, ContinuationSubmitter, DispatchContext, Identity, ResourceType,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::base::{EnvironmentWorkflow, PhaseResult, WorkflowHandler};
use super::delete::DeleteEnvironmentInput;
use super::phase::{Phase, WorkflowInput, attach};
use super::provisioning::{self, Probe, RESOURCE_STATE_RETRY, START_COMPUTE_RETRY};
use super::record::EnvironmentRecord;
use super::{Collaborators, reasons};
use crate::error::Result;
use crate::model::{EnvironmentOperation, EnvironmentState};
use crate::providers::{
    AllocateRequest, BrokerError, EnvironmentMonitor, HeartbeatRepository, ResourceBroker,
    StartAction,
};
use crate::target::EnvironmentTarget;

/// Phases of [`CreateEnvironmentWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePhase {
    /// Allocate compute, OS disk and storage.
    AllocateResource,
    /// Wait for allocation.
    CheckResourceState,
    /// Boot the compute.
    StartCompute,
    /// Wait for boot.
    CheckStartCompute,
    /// Register heartbeats and mark the environment available.
    StartHeartbeatMonitoring,
}

impl Phase for CreatePhase {
    const INITIAL: Self = Self::AllocateResource;
    const ALL: &'static [Self] = &[
        Self::AllocateResource,
        Self::CheckResourceState,
        Self::StartCompute,
        Self::CheckStartCompute,
        Self::StartHeartbeatMonitoring,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::AllocateResource => "allocate_resource",
            Self::CheckResourceState => "check_resource_state",
            Self::StartCompute => "start_compute",
            Self::CheckStartCompute => "check_start_compute",
            Self::StartHeartbeatMonitoring => "start_heartbeat_monitoring",
        }
    }

    fn budget(self) -> Option<Duration> {
        match self {
            Self::CheckResourceState => Some(Duration::from_secs(30 * 60)),
            Self::CheckStartCompute => Some(Duration::from_secs(15 * 60)),
            _ => None,
        }
    }
}

/// Handler for `create-environment`.
pub type CreateEnvironmentHandler = WorkflowHandler<CreateEnvironmentWorkflow>;

/// Provisions a freshly created environment.
pub struct CreateEnvironmentWorkflow {
    broker: Arc<dyn ResourceBroker>,
    heartbeats: Arc<dyn HeartbeatRepository>,
    monitor: Arc<dyn EnvironmentMonitor>,
    submitter: ContinuationSubmitter<EnvironmentTarget>,
}

impl CreateEnvironmentWorkflow {
    /// Build from collaborators. `submitter` starts the cleanup delete on failure.
    pub fn new(
        collaborators: &Collaborators,
        submitter: ContinuationSubmitter<EnvironmentTarget>,
    ) -> Self {
        Self {
            broker: Arc::clone(&collaborators.broker),
            heartbeats: Arc::clone(&collaborators.heartbeats),
            monitor: Arc::clone(&collaborators.monitor),
            submitter,
        }
    }

    async fn allocate(
        &self,
        mut input: WorkflowInput<CreatePhase>,
        record: &mut EnvironmentRecord<'_>,
    ) -> PhaseResult<CreatePhase> {
        if !matches!(
            record.state,
            EnvironmentState::Created | EnvironmentState::Provisioning
        ) {
            return Ok(ContinuationResult::cancelled(reasons::INVALID_ENVIRONMENT_STATE));
        }

        // A redelivered step finds the references already persisted.
        if record.compute.is_none() {
            let requests = [
                AllocateRequest::new(ResourceType::ComputeVm, &record.location, &record.sku_name),
                AllocateRequest::new(ResourceType::OsDisk, &record.location, &record.sku_name),
                AllocateRequest::new(
                    ResourceType::StorageFileShare,
                    &record.location,
                    &record.sku_name,
                ),
            ];
            let refs = match self.broker.allocate(record.id, &requests).await {
                Ok(refs) => refs,
                Err(BrokerError::Rejected(message)) => {
                    warn!(environment_id = %record.id, %message, "Allocation rejected");
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                }
                Err(e) => return Err(e.into()),
            };
            let (Some(compute), Some(os_disk), Some(storage)) = (
                provisioning::find(&refs, ResourceType::ComputeVm).cloned(),
                provisioning::find(&refs, ResourceType::OsDisk).cloned(),
                provisioning::find(&refs, ResourceType::StorageFileShare).cloned(),
            ) else {
                return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
            };

            let stored = record
                .update(|env| {
                    if env.compute.is_some() {
                        return false;
                    }
                    env.compute = Some(compute.clone());
                    env.os_disk = Some(os_disk.clone());
                    env.storage = Some(storage.clone());
                    env.set_state(EnvironmentState::Provisioning);
                    true
                })
                .await?;
            if !stored {
                // Lost the race to a duplicate delivery; give back what we allocated.
                for resource in [&compute, &os_disk, &storage] {
                    if let Err(e) =
                        provisioning::delete_resource(self.broker.as_ref(), record.id, resource).await
                    {
                        warn!(environment_id = %record.id, resource_id = %resource.resource_id, error = %e, "Failed to release duplicate allocation");
                    }
                }
            }
        } else {
            record
                .update(|env| env.set_state(EnvironmentState::Provisioning))
                .await?;
        }

        for (slot, name, resource) in [
            (&mut input.compute, "compute", &record.compute),
            (&mut input.os_disk, "os_disk", &record.os_disk),
            (&mut input.storage, "storage", &record.storage),
        ] {
            if let Some(resource) = resource {
                attach(slot, name, resource)?;
            }
        }

        info!(environment_id = %record.id, "Resources allocated");
        Ok(ContinuationResult::in_progress(
            input.advance(CreatePhase::CheckResourceState)?,
        ))
    }
}

#[async_trait]
impl EnvironmentWorkflow for CreateEnvironmentWorkflow {
    type Phase = CreatePhase;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::CreateEnvironment
    }

    fn operation(&self) -> EnvironmentOperation {
        EnvironmentOperation::Provisioning
    }

    fn name(&self) -> &'static str {
        "CreateEnvironment"
    }

    async fn run_phase(
        &self,
        input: WorkflowInput<CreatePhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> PhaseResult<CreatePhase> {
        let environment_id = input.environment_id;
        match input.current_state {
            CreatePhase::AllocateResource => self.allocate(input, record).await,

            CreatePhase::CheckResourceState => {
                let resources: Vec<_> = [&input.compute, &input.os_disk, &input.storage]
                    .into_iter()
                    .flatten()
                    .collect();
                if resources.len() < 3 {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                }
                match provisioning::probe_resources(self.broker.as_ref(), environment_id, &resources)
                    .await?
                {
                    Probe::Ready => Ok(ContinuationResult::in_progress(
                        input.advance(CreatePhase::StartCompute)?,
                    )),
                    Probe::Pending => Ok(ContinuationResult::in_progress_after(input, RESOURCE_STATE_RETRY)),
                    Probe::Failed(reason) => Ok(ContinuationResult::failed(reason)),
                }
            }

            CreatePhase::StartCompute => {
                if !matches!(
                    record.state,
                    EnvironmentState::Provisioning | EnvironmentState::Starting
                ) {
                    return Ok(ContinuationResult::cancelled(reasons::INVALID_ENVIRONMENT_STATE));
                }
                let Some(compute) = input.compute.clone() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                };
                let ids: Vec<_> = [&input.compute, &input.os_disk, &input.storage]
                    .into_iter()
                    .flatten()
                    .map(|r| r.resource_id)
                    .collect();
                if let Some(reason) = provisioning::start_compute(
                    self.broker.as_ref(),
                    environment_id,
                    StartAction::StartCompute,
                    &compute,
                    &ids,
                )
                .await?
                {
                    return Ok(ContinuationResult::failed(reason));
                }
                record
                    .update(|env| env.set_state(EnvironmentState::Starting))
                    .await?;
                Ok(ContinuationResult::in_progress_after(
                    input.advance(CreatePhase::CheckStartCompute)?,
                    START_COMPUTE_RETRY,
                ))
            }

            CreatePhase::CheckStartCompute => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                };
                match provisioning::probe_start(self.broker.as_ref(), environment_id, compute).await? {
                    Probe::Ready => Ok(ContinuationResult::in_progress(
                        input.advance(CreatePhase::StartHeartbeatMonitoring)?,
                    )),
                    Probe::Pending => Ok(ContinuationResult::in_progress_after(input, START_COMPUTE_RETRY)),
                    Probe::Failed(reason) => Ok(ContinuationResult::failed(reason)),
                }
            }

            CreatePhase::StartHeartbeatMonitoring => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                };
                self.monitor
                    .monitor_heartbeat(environment_id, compute.resource_id)
                    .await?;
                let heartbeat_id = provisioning::ensure_heartbeat(
                    self.heartbeats.as_ref(),
                    environment_id,
                    record.heartbeat_id,
                )
                .await?;
                record
                    .update(|env| {
                        let moved = env.set_state(EnvironmentState::Available);
                        let linked = env.heartbeat_id.replace(heartbeat_id) != Some(heartbeat_id);
                        moved || linked
                    })
                    .await?;
                Ok(ContinuationResult::succeeded())
            }
        }
    }

    /// Mark the environment failed and hand its resources to a release-only delete.
    async fn on_failed(
        &self,
        input: &WorkflowInput<CreatePhase>,
        record: &mut EnvironmentRecord<'_>,
        ctx: &DispatchContext,
    ) -> Result<()> {
        record
            .update(|env| env.set_state(EnvironmentState::Failed))
            .await?;

        let cleanup = DeleteEnvironmentInput {
            environment_id: record.id,
            reason: format!("create failed: {}", input.reason),
            compute: record.compute.clone().or_else(|| input.compute.clone()),
            os_disk: record.os_disk.clone().or_else(|| input.os_disk.clone()),
            storage: record.storage.clone().or_else(|| input.storage.clone()),
            archive: None,
            release_only: true,
        };
        if !cleanup.has_resources() {
            return Ok(());
        }
        let tracking_id = self
            .submitter
            .submit_as(
                EnvironmentTarget::DeleteEnvironment,
                &cleanup,
                Identity::Superuser,
            )
            .await?;
        info!(
            environment_id = %record.id,
            create_tracking_id = %ctx.tracking_id,
            cleanup_tracking_id = %tracking_id,
            "Submitted cleanup for failed create"
        );
        Ok(())
    }
}
