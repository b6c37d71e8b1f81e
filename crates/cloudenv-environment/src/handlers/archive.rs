// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive: move a shut-down environment's storage into a cold blob.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudenv_core::{ContinuationResult, DispatchContext, Elevation, ResourceType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::base::{EnvironmentWorkflow, PhaseResult, WorkflowHandler};
use super::phase::{Phase, WorkflowInput, attach};
use super::provisioning;
use super::record::EnvironmentRecord;
use super::{Collaborators, reasons};
use crate::error::Result;
use crate::model::{CloudEnvironment, EnvironmentOperation, EnvironmentState};
use crate::providers::{
    AllocateRequest, BrokerError, BrokerOperationStatus, ResourceBroker, StartAction,
};
use crate::target::EnvironmentTarget;

/// Poll interval while storage is copied into the archive blob.
pub const ARCHIVE_POLL_RETRY: Duration = Duration::from_secs(30);

/// Phases of [`ArchiveEnvironmentWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePhase {
    /// Allocate the archive blob.
    AllocateStorageBlob,
    /// Start copying storage into it.
    StartStorageBlob,
    /// Wait for the copy.
    CheckStartStorageBlob,
    /// Swap storage to the blob and delete the file share.
    CleanupUnneededStorage,
}

impl Phase for ArchivePhase {
    const INITIAL: Self = Self::AllocateStorageBlob;
    const ALL: &'static [Self] = &[
        Self::AllocateStorageBlob,
        Self::StartStorageBlob,
        Self::CheckStartStorageBlob,
        Self::CleanupUnneededStorage,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::AllocateStorageBlob => "allocate_storage_blob",
            Self::StartStorageBlob => "start_storage_blob",
            Self::CheckStartStorageBlob => "check_start_storage_blob",
            Self::CleanupUnneededStorage => "cleanup_unneeded_storage",
        }
    }

    fn budget(self) -> Option<Duration> {
        match self {
            Self::CheckStartStorageBlob => Some(Duration::from_secs(4 * 3600)),
            _ => None,
        }
    }
}

/// Handler for `archive-environment`.
pub type ArchiveEnvironmentHandler = WorkflowHandler<ArchiveEnvironmentWorkflow>;

/// Archives environments that stayed shut down long enough.
///
/// Runs as superuser: it is started by the archive scan, not by the owner.
pub struct ArchiveEnvironmentWorkflow {
    broker: Arc<dyn ResourceBroker>,
}

impl ArchiveEnvironmentWorkflow {
    /// Build from collaborators.
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            broker: Arc::clone(&collaborators.broker),
        }
    }
}

/// Still the shutdown the archival was scheduled for.
fn unchanged_since(env: &CloudEnvironment, last_state_updated: DateTime<Utc>) -> bool {
    env.state == EnvironmentState::Shutdown && env.last_state_updated == last_state_updated
}

/// The swap already happened for `archive`.
fn swapped_to(env: &CloudEnvironment, archive: Option<&cloudenv_core::ResourceRef>) -> bool {
    env.state == EnvironmentState::Archived
        && archive.is_some_and(|a| env.storage.as_ref().is_some_and(|s| s.same_resource(a)))
}

#[async_trait]
impl EnvironmentWorkflow for ArchiveEnvironmentWorkflow {
    type Phase = ArchivePhase;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::ArchiveEnvironment
    }

    fn operation(&self) -> EnvironmentOperation {
        EnvironmentOperation::Archiving
    }

    fn name(&self) -> &'static str {
        "ArchiveEnvironment"
    }

    fn elevation(&self) -> Elevation {
        Elevation::Superuser
    }

    async fn run_phase(
        &self,
        mut input: WorkflowInput<ArchivePhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> PhaseResult<ArchivePhase> {
        let environment_id = input.environment_id;
        let scheduled_for = input.last_state_updated;

        if !unchanged_since(record, scheduled_for) {
            let resumable = input.current_state == ArchivePhase::CleanupUnneededStorage
                && swapped_to(record, input.archive.as_ref());
            if !resumable {
                info!(
                    %environment_id,
                    state = %record.state,
                    "Environment changed since archival was scheduled"
                );
                return Ok(ContinuationResult::cancelled(reasons::ENVIRONMENT_STATE_CHANGED));
            }
        }

        match input.current_state {
            ArchivePhase::AllocateStorageBlob => {
                let Some(storage) = record.storage.clone() else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_BLOB_STORAGE_ALLOCATE));
                };
                attach(&mut input.storage, "storage", &storage)?;

                let archive = match record.pending_archive.clone() {
                    Some(existing) => existing,
                    None => {
                        let request = AllocateRequest::new(
                            ResourceType::StorageArchive,
                            &record.location,
                            &storage.sku_name,
                        );
                        let refs = match self.broker.allocate(environment_id, &[request]).await {
                            Ok(refs) => refs,
                            Err(BrokerError::Rejected(message)) => {
                                warn!(%environment_id, %message, "Archive blob allocation rejected");
                                return Ok(ContinuationResult::failed(
                                    reasons::INVALID_BLOB_STORAGE_ALLOCATE,
                                ));
                            }
                            Err(e) => return Err(e.into()),
                        };
                        let Some(blob) =
                            provisioning::find(&refs, ResourceType::StorageArchive).cloned()
                        else {
                            return Ok(ContinuationResult::failed(
                                reasons::INVALID_BLOB_STORAGE_ALLOCATE,
                            ));
                        };
                        let stored = record
                            .update(|env| {
                                if !unchanged_since(env, scheduled_for) || env.pending_archive.is_some() {
                                    return false;
                                }
                                env.pending_archive = Some(blob.clone());
                                true
                            })
                            .await?;
                        if !stored {
                            if let Err(e) =
                                provisioning::delete_resource(self.broker.as_ref(), environment_id, &blob)
                                    .await
                            {
                                warn!(%environment_id, resource_id = %blob.resource_id, error = %e, "Failed to release unused archive blob");
                            }
                            match record.pending_archive.clone() {
                                Some(existing) if unchanged_since(record, scheduled_for) => existing,
                                _ => {
                                    return Ok(ContinuationResult::cancelled(
                                        reasons::ENVIRONMENT_STATE_CHANGED,
                                    ));
                                }
                            }
                        } else {
                            blob
                        }
                    }
                };
                attach(&mut input.archive, "archive", &archive)?;
                Ok(ContinuationResult::in_progress(
                    input.advance(ArchivePhase::StartStorageBlob)?,
                ))
            }

            ArchivePhase::StartStorageBlob => {
                let (Some(storage), Some(archive)) = (input.storage.as_ref(), input.archive.as_ref())
                else {
                    return Ok(ContinuationResult::failed(reasons::INVALID_BLOB_STORAGE_START));
                };
                let resources = [archive.resource_id, storage.resource_id];
                match self
                    .broker
                    .start(environment_id, StartAction::StartArchive, &resources)
                    .await
                {
                    Ok(()) => Ok(ContinuationResult::in_progress_after(
                        input.advance(ArchivePhase::CheckStartStorageBlob)?,
                        ARCHIVE_POLL_RETRY,
                    )),
                    Err(BrokerError::Rejected(message)) => {
                        warn!(%environment_id, %message, "Archive copy rejected");
                        Ok(ContinuationResult::failed(reasons::INVALID_BLOB_STORAGE_START))
                    }
                    Err(BrokerError::NotFound { .. }) => {
                        Ok(ContinuationResult::failed(reasons::INVALID_BLOB_STORAGE_START))
                    }
                    Err(e) => Err(e.into()),
                }
            }

            ArchivePhase::CheckStartStorageBlob => {
                let Some(archive) = input.archive.as_ref() else {
                    return Ok(ContinuationResult::failed(
                        reasons::INVALID_BLOB_STORAGE_START_STATUS,
                    ));
                };
                match self.broker.status(environment_id, archive.resource_id).await {
                    Ok(state) => match state.starting {
                        Some(BrokerOperationStatus::Succeeded) => Ok(ContinuationResult::in_progress(
                            input.advance(ArchivePhase::CleanupUnneededStorage)?,
                        )),
                        None => Ok(ContinuationResult::in_progress_after(input, ARCHIVE_POLL_RETRY)),
                        Some(s) if s.is_pending() => {
                            Ok(ContinuationResult::in_progress_after(input, ARCHIVE_POLL_RETRY))
                        }
                        Some(_) => Ok(ContinuationResult::failed(
                            reasons::INVALID_BLOB_STORAGE_START_STATUS,
                        )),
                    },
                    Err(BrokerError::NotFound { .. }) => Ok(ContinuationResult::failed(
                        reasons::INVALID_BLOB_STORAGE_START_STATUS,
                    )),
                    Err(e) => Err(e.into()),
                }
            }

            ArchivePhase::CleanupUnneededStorage => {
                let (Some(storage), Some(archive)) = (input.storage.clone(), input.archive.clone())
                else {
                    return Ok(ContinuationResult::failed(reasons::FAILED_STORAGE_SWAP));
                };

                if !swapped_to(record, Some(&archive)) {
                    let swapped = record
                        .update(|env| {
                            if !unchanged_since(env, scheduled_for) {
                                return false;
                            }
                            env.storage = Some(archive.clone());
                            env.pending_archive = None;
                            env.scheduled_archival = None;
                            env.set_state(EnvironmentState::Archived);
                            true
                        })
                        .await;
                    match swapped {
                        Ok(true) => {}
                        Ok(false) if swapped_to(record, Some(&archive)) => {}
                        Ok(false) => {
                            return Ok(ContinuationResult::cancelled(
                                reasons::ENVIRONMENT_STATE_CHANGED,
                            ));
                        }
                        Err(e) => {
                            warn!(%environment_id, error = %e, "Storage swap failed");
                            return Ok(ContinuationResult::failed(reasons::FAILED_STORAGE_SWAP));
                        }
                    }
                }

                match provisioning::delete_resource(self.broker.as_ref(), environment_id, &storage).await {
                    Ok(()) => {
                        info!(%environment_id, archive_id = %archive.resource_id, "Environment archived");
                        Ok(ContinuationResult::succeeded())
                    }
                    Err(BrokerError::Rejected(message)) => {
                        warn!(%environment_id, %message, "Old storage delete rejected");
                        Ok(ContinuationResult::failed(reasons::FAILED_STORAGE_DELETE))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Release an archive blob that never got swapped in.
    async fn on_failed(
        &self,
        _input: &WorkflowInput<ArchivePhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        let Some(pending) = record.pending_archive.clone() else {
            return Ok(());
        };
        provisioning::delete_resource(self.broker.as_ref(), record.id, &pending).await?;
        record
            .update(|env| env.pending_archive.take().is_some())
            .await?;
        Ok(())
    }
}
