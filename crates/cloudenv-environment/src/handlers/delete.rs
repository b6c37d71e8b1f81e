// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delete: release every resource of an environment and mark it deleted.
//!
//! A release-only delete frees the resources and drops their references but leaves
//! the environment's state alone.

use std::sync::Arc;

use async_trait::async_trait;
use cloudenv_core::{
    ContinuationResult, DispatchContext, Elevation, HandlerError, OperationState, PhaseHandler,
    ResourceRef,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::provisioning;
use super::reasons;
use super::record::EnvironmentRecord;
use crate::model::{CloudEnvironment, EnvironmentOperation, EnvironmentState};
use crate::providers::{EnvironmentRepository, ResourceBroker};
use crate::target::EnvironmentTarget;

/// Input of `delete-environment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEnvironmentInput {
    /// Environment whose resources are deleted.
    pub environment_id: Uuid,
    /// Why.
    pub reason: String,
    /// Compute to delete.
    #[serde(default)]
    pub compute: Option<ResourceRef>,
    /// OS disk to delete.
    #[serde(default)]
    pub os_disk: Option<ResourceRef>,
    /// Storage to delete.
    #[serde(default)]
    pub storage: Option<ResourceRef>,
    /// Archive blob to delete.
    #[serde(default)]
    pub archive: Option<ResourceRef>,
    /// Only release the resources; keep the environment's state.
    #[serde(default)]
    pub release_only: bool,
}

impl DeleteEnvironmentInput {
    /// Input deleting everything `env` references.
    pub fn for_environment(env: &crate::model::CloudEnvironment, reason: impl Into<String>) -> Self {
        Self {
            environment_id: env.id,
            reason: reason.into(),
            compute: env.compute.clone(),
            os_disk: env.os_disk.clone(),
            storage: env.storage.clone(),
            archive: env.pending_archive.clone(),
            release_only: false,
        }
    }

    /// Keep the environment's state once the resources are released.
    pub fn releasing_only(mut self) -> Self {
        self.release_only = true;
        self
    }

    /// Whether anything is left to delete.
    pub fn has_resources(&self) -> bool {
        self.resources().next().is_some()
    }

    fn resources(&self) -> impl Iterator<Item = &ResourceRef> {
        [&self.compute, &self.os_disk, &self.storage, &self.archive]
            .into_iter()
            .flatten()
    }
}

/// Handler for `delete-environment`. Runs as superuser.
pub struct DeleteEnvironmentHandler {
    broker: Arc<dyn ResourceBroker>,
    repository: Arc<dyn EnvironmentRepository>,
}

impl DeleteEnvironmentHandler {
    /// Build from the broker and repository.
    pub fn new(broker: Arc<dyn ResourceBroker>, repository: Arc<dyn EnvironmentRepository>) -> Self {
        Self { broker, repository }
    }
}

#[async_trait]
impl PhaseHandler<EnvironmentTarget> for DeleteEnvironmentHandler {
    type Input = DeleteEnvironmentInput;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::DeleteEnvironment
    }

    fn name(&self) -> &'static str {
        "DeleteEnvironment"
    }

    fn elevation(&self) -> Elevation {
        Elevation::Superuser
    }

    async fn continue_phase(
        &self,
        input: DeleteEnvironmentInput,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<DeleteEnvironmentInput>, HandlerError> {
        let environment_id = input.environment_id;

        let mut failed = 0usize;
        for resource in input.resources() {
            if let Err(e) =
                provisioning::delete_resource(self.broker.as_ref(), environment_id, resource).await
            {
                warn!(
                    %environment_id,
                    resource_id = %resource.resource_id,
                    resource_type = %resource.resource_type,
                    error = %e,
                    "Resource delete failed"
                );
                failed += 1;
            }
        }

        let record = EnvironmentRecord::load(self.repository.as_ref(), environment_id, &ctx.identity)
            .await
            .map_err(|e| HandlerError::from(crate::Error::from(e)))?;
        let tracking_id = ctx.tracking_id;

        if failed > 0 {
            if let Some(mut record) = record
                && let Err(e) = record
                    .update(|env| {
                        env.record_transition(
                            EnvironmentOperation::Deleting,
                            OperationState::Failed,
                            Some(reasons::DELETION_FAILED),
                            tracking_id,
                        )
                    })
                    .await
            {
                warn!(%environment_id, error = %e, "Failed to record deletion failure");
            }
            return Ok(ContinuationResult::failed(reasons::DELETION_FAILED));
        }

        if let Some(mut record) = record {
            if input.release_only {
                record.update(|env| release_references(env, &input)).await?;
            } else {
                record
                    .update(|env| {
                        env.compute = None;
                        env.os_disk = None;
                        env.storage = None;
                        env.pending_archive = None;
                        env.scheduled_archival = None;
                        env.set_state(EnvironmentState::Deleted);
                        env.record_transition(
                            EnvironmentOperation::Deleting,
                            OperationState::Succeeded,
                            None,
                            tracking_id,
                        );
                        true
                    })
                    .await?;
            }
        }

        if input.release_only {
            info!(%environment_id, reason = %input.reason, "Environment resources released");
        } else {
            info!(%environment_id, reason = %input.reason, "Environment deleted");
        }
        Ok(ContinuationResult::succeeded())
    }
}

/// Drop the references `input` released. Returns whether anything changed.
fn release_references(env: &mut CloudEnvironment, input: &DeleteEnvironmentInput) -> bool {
    let mut changed = false;
    for (slot, released) in [
        (&mut env.compute, &input.compute),
        (&mut env.os_disk, &input.os_disk),
        (&mut env.storage, &input.storage),
        (&mut env.pending_archive, &input.archive),
    ] {
        if let Some(released) = released {
            changed |= slot.take_if(|r| r.same_resource(released)).is_some();
        }
    }
    changed
}
