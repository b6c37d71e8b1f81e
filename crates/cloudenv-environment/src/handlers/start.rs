// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start and export: boot a stopped environment on fresh compute.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudenv_core::{ContinuationResult, DispatchContext, ResourceRef, ResourceType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::base::{EnvironmentWorkflow, PhaseResult, WorkflowHandler};
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

/// Phases of [`StartEnvironmentWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPhase {
    /// Verify the kept OS disk and storage.
    GetResource,
    /// Allocate compute.
    AllocateResource,
    /// Wait for allocation.
    CheckResourceState,
    /// Boot the compute.
    StartCompute,
    /// Wait for boot.
    CheckStartCompute,
    /// Register heartbeats.
    StartHeartbeatMonitoring,
    /// Link the heartbeat record.
    GetHeartbeatRecord,
}

impl Phase for StartPhase {
    const INITIAL: Self = Self::GetResource;
    const ALL: &'static [Self] = &[
        Self::GetResource,
        Self::AllocateResource,
        Self::CheckResourceState,
        Self::StartCompute,
        Self::CheckStartCompute,
        Self::StartHeartbeatMonitoring,
        Self::GetHeartbeatRecord,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::GetResource => "get_resource",
            Self::AllocateResource => "allocate_resource",
            Self::CheckResourceState => "check_resource_state",
            Self::StartCompute => "start_compute",
            Self::CheckStartCompute => "check_start_compute",
            Self::StartHeartbeatMonitoring => "start_heartbeat_monitoring",
            Self::GetHeartbeatRecord => "get_heartbeat_record",
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

/// Why the environment is being booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// For use.
    Resume,
    /// To export its contents.
    Export,
}

impl StartKind {
    fn target(self) -> EnvironmentTarget {
        match self {
            Self::Resume => EnvironmentTarget::StartEnvironment,
            Self::Export => EnvironmentTarget::ExportEnvironment,
        }
    }

    fn operation(self) -> EnvironmentOperation {
        match self {
            Self::Resume => EnvironmentOperation::Resuming,
            Self::Export => EnvironmentOperation::Exporting,
        }
    }

    fn action(self) -> StartAction {
        match self {
            Self::Resume => StartAction::StartCompute,
            Self::Export => StartAction::StartExport,
        }
    }

    /// State held while booting.
    fn booting_state(self) -> EnvironmentState {
        match self {
            Self::Resume => EnvironmentState::Starting,
            Self::Export => EnvironmentState::Exporting,
        }
    }

    /// State once booted.
    fn running_state(self) -> EnvironmentState {
        match self {
            Self::Resume => EnvironmentState::Available,
            Self::Export => EnvironmentState::Exporting,
        }
    }
}

/// Handler for `start-environment` and `export-environment`.
pub type StartEnvironmentHandler = WorkflowHandler<StartEnvironmentWorkflow>;

/// Boots a shut-down or archived environment.
pub struct StartEnvironmentWorkflow {
    kind: StartKind,
    broker: Arc<dyn ResourceBroker>,
    heartbeats: Arc<dyn HeartbeatRepository>,
    monitor: Arc<dyn EnvironmentMonitor>,
}

impl StartEnvironmentWorkflow {
    /// Build from collaborators.
    pub fn new(collaborators: &Collaborators, kind: StartKind) -> Self {
        Self {
            kind,
            broker: Arc::clone(&collaborators.broker),
            heartbeats: Arc::clone(&collaborators.heartbeats),
            monitor: Arc::clone(&collaborators.monitor),
        }
    }

    /// Whether a kept resource still exists and is usable.
    async fn usable(&self, environment_id: uuid::Uuid, resource: &ResourceRef) -> Result<bool> {
        match self.broker.status(environment_id, resource.resource_id).await {
            Ok(state) => Ok(state.is_ready()),
            Err(BrokerError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_resources(
        &self,
        mut input: WorkflowInput<StartPhase>,
        record: &mut EnvironmentRecord<'_>,
    ) -> PhaseResult<StartPhase> {
        if self.kind == StartKind::Resume
            && record.state == EnvironmentState::Available
            && record.compute.is_some()
        {
            return Ok(ContinuationResult::succeeded());
        }
        if let Some(os_disk) = record.os_disk.clone() {
            if !self.usable(record.id, &os_disk).await? {
                return Ok(ContinuationResult::failed(reasons::FAILED_TO_GET_OS_DISK_RESOURCE));
            }
            attach(&mut input.os_disk, "os_disk", &os_disk)?;
        }
        let Some(storage) = record.storage.clone() else {
            return Ok(ContinuationResult::failed(reasons::FAILED_TO_GET_STORAGE_RESOURCE));
        };
        if !self.usable(record.id, &storage).await? {
            return Ok(ContinuationResult::failed(reasons::FAILED_TO_GET_STORAGE_RESOURCE));
        }
        attach(&mut input.storage, "storage", &storage)?;
        Ok(ContinuationResult::in_progress(
            input.advance(StartPhase::AllocateResource)?,
        ))
    }

    async fn allocate_compute(
        &self,
        mut input: WorkflowInput<StartPhase>,
        record: &mut EnvironmentRecord<'_>,
    ) -> PhaseResult<StartPhase> {
        let booting = self.kind.booting_state();
        if record.compute.is_none() {
            let request = AllocateRequest::new(ResourceType::ComputeVm, &record.location, &record.sku_name);
            let refs = match self.broker.allocate(record.id, &[request]).await {
                Ok(refs) => refs,
                Err(BrokerError::Rejected(message)) => {
                    warn!(environment_id = %record.id, %message, "Compute allocation rejected");
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                }
                Err(e) => return Err(e.into()),
            };
            let Some(compute) = provisioning::find(&refs, ResourceType::ComputeVm).cloned() else {
                return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
            };
            let stored = record
                .update(|env| {
                    if env.compute.is_some() {
                        return false;
                    }
                    env.compute = Some(compute.clone());
                    env.scheduled_archival = None;
                    env.set_state(booting);
                    true
                })
                .await?;
            if !stored
                && let Err(e) =
                    provisioning::delete_resource(self.broker.as_ref(), record.id, &compute).await
            {
                warn!(environment_id = %record.id, resource_id = %compute.resource_id, error = %e, "Failed to release duplicate allocation");
            }
        } else {
            record
                .update(|env| {
                    let cleared = env.scheduled_archival.take().is_some();
                    env.set_state(booting) || cleared
                })
                .await?;
        }

        let Some(compute) = record.compute.clone() else {
            return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
        };
        attach(&mut input.compute, "compute", &compute)?;
        Ok(ContinuationResult::in_progress(
            input.advance(StartPhase::CheckResourceState)?,
        ))
    }
}

#[async_trait]
impl EnvironmentWorkflow for StartEnvironmentWorkflow {
    type Phase = StartPhase;

    fn target(&self) -> EnvironmentTarget {
        self.kind.target()
    }

    fn operation(&self) -> EnvironmentOperation {
        self.kind.operation()
    }

    fn name(&self) -> &'static str {
        match self.kind {
            StartKind::Resume => "StartEnvironment",
            StartKind::Export => "ExportEnvironment",
        }
    }

    async fn run_phase(
        &self,
        input: WorkflowInput<StartPhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> PhaseResult<StartPhase> {
        if record.state.is_invalid_or_failed() {
            return Ok(ContinuationResult::failed(reasons::FAILED_ENVIRONMENT_START_STATE));
        }

        let environment_id = input.environment_id;
        match input.current_state {
            StartPhase::GetResource => self.get_resources(input, record).await,

            StartPhase::AllocateResource => self.allocate_compute(input, record).await,

            StartPhase::CheckResourceState => {
                let resources: Vec<_> = [&input.compute, &input.os_disk, &input.storage]
                    .into_iter()
                    .flatten()
                    .collect();
                match provisioning::probe_resources(self.broker.as_ref(), environment_id, &resources)
                    .await?
                {
                    Probe::Ready => Ok(ContinuationResult::in_progress(
                        input.advance(StartPhase::StartCompute)?,
                    )),
                    Probe::Pending => Ok(ContinuationResult::in_progress_after(input, RESOURCE_STATE_RETRY)),
                    Probe::Failed(reason) => Ok(ContinuationResult::failed(reason)),
                }
            }

            StartPhase::StartCompute => {
                if record.state != self.kind.booting_state() {
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
                    self.kind.action(),
                    &compute,
                    &ids,
                )
                .await?
                {
                    return Ok(ContinuationResult::failed(reason));
                }
                Ok(ContinuationResult::in_progress_after(
                    input.advance(StartPhase::CheckStartCompute)?,
                    START_COMPUTE_RETRY,
                ))
            }

            StartPhase::CheckStartCompute => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                };
                match provisioning::probe_start(self.broker.as_ref(), environment_id, compute).await? {
                    Probe::Ready => Ok(ContinuationResult::in_progress(
                        input.advance(StartPhase::StartHeartbeatMonitoring)?,
                    )),
                    Probe::Pending => Ok(ContinuationResult::in_progress_after(input, START_COMPUTE_RETRY)),
                    Probe::Failed(reason) => Ok(ContinuationResult::failed(reason)),
                }
            }

            StartPhase::StartHeartbeatMonitoring => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_COMPUTE_ALLOCATION));
                };
                self.monitor
                    .monitor_heartbeat(environment_id, compute.resource_id)
                    .await?;
                let running = self.kind.running_state();
                record.update(|env| env.set_state(running)).await?;
                Ok(ContinuationResult::in_progress(
                    input.advance(StartPhase::GetHeartbeatRecord)?,
                ))
            }

            StartPhase::GetHeartbeatRecord => {
                let heartbeat_id = provisioning::ensure_heartbeat(
                    self.heartbeats.as_ref(),
                    environment_id,
                    record.heartbeat_id,
                )
                .await?;
                record
                    .update(|env| env.heartbeat_id.replace(heartbeat_id) != Some(heartbeat_id))
                    .await?;
                Ok(ContinuationResult::succeeded())
            }
        }
    }

    /// Release the compute this run brought up and put the environment back to shutdown.
    ///
    /// Compute the run never attached belongs to someone else and is left alone, as is
    /// an environment in an invalid or failed state.
    async fn on_failed(
        &self,
        input: &WorkflowInput<StartPhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        if record.state.is_invalid_or_failed() {
            return Ok(());
        }
        let Some(compute) = input.compute.clone() else {
            record
                .update(|env| {
                    !env.state.is_invalid_or_failed() && env.set_state(EnvironmentState::Shutdown)
                })
                .await?;
            return Ok(());
        };
        provisioning::delete_resource(self.broker.as_ref(), record.id, &compute).await?;
        record
            .update(|env| {
                let released = env
                    .compute
                    .take_if(|c| c.same_resource(&compute))
                    .is_some();
                let stopped =
                    !env.state.is_invalid_or_failed() && env.set_state(EnvironmentState::Shutdown);
                released || stopped
            })
            .await?;
        Ok(())
    }
}
