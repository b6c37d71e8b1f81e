// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shutdown: release the compute, keep the storage, schedule archival.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloudenv_core::{ContinuationResult, DispatchContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::base::{EnvironmentWorkflow, PhaseResult, WorkflowHandler};
use super::phase::{Phase, WorkflowInput, attach};
use super::record::EnvironmentRecord;
use super::{Collaborators, reasons};
use crate::model::{EnvironmentOperation, EnvironmentState};
use crate::providers::{BrokerError, BrokerOperationStatus, ResourceBroker};
use crate::target::EnvironmentTarget;

/// Poll interval of the shutdown checks.
pub const SHUTDOWN_POLL_RETRY: Duration = Duration::from_secs(2);

/// Phases of [`ShutdownEnvironmentWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    /// Wait for in-VM cleanup to finish.
    CheckComputeCleanupStatus,
    /// Delete the compute.
    ComputeDelete,
    /// Wait for the compute to disappear.
    CheckComputeDeleteStatus,
    /// Persist the shutdown.
    MarkShutdown,
}

impl Phase for ShutdownPhase {
    const INITIAL: Self = Self::CheckComputeCleanupStatus;
    const ALL: &'static [Self] = &[
        Self::CheckComputeCleanupStatus,
        Self::ComputeDelete,
        Self::CheckComputeDeleteStatus,
        Self::MarkShutdown,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::CheckComputeCleanupStatus => "check_compute_cleanup_status",
            Self::ComputeDelete => "compute_delete",
            Self::CheckComputeDeleteStatus => "check_compute_delete_status",
            Self::MarkShutdown => "mark_shutdown",
        }
    }

    fn budget(self) -> Option<Duration> {
        match self {
            Self::CheckComputeCleanupStatus | Self::CheckComputeDeleteStatus => {
                Some(Duration::from_secs(10 * 60))
            }
            _ => None,
        }
    }
}

/// Handler for `shutdown-environment`.
pub type ShutdownEnvironmentHandler = WorkflowHandler<ShutdownEnvironmentWorkflow>;

/// Stops a running environment.
pub struct ShutdownEnvironmentWorkflow {
    broker: Arc<dyn ResourceBroker>,
    archive_after: Duration,
}

impl ShutdownEnvironmentWorkflow {
    /// Build from collaborators. Environments become due for archival `archive_after`
    /// past shutdown.
    pub fn new(collaborators: &Collaborators, archive_after: Duration) -> Self {
        Self {
            broker: Arc::clone(&collaborators.broker),
            archive_after,
        }
    }
}

#[async_trait]
impl EnvironmentWorkflow for ShutdownEnvironmentWorkflow {
    type Phase = ShutdownPhase;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::ShutdownEnvironment
    }

    fn operation(&self) -> EnvironmentOperation {
        EnvironmentOperation::ShuttingDown
    }

    fn name(&self) -> &'static str {
        "ShutdownEnvironment"
    }

    async fn run_phase(
        &self,
        mut input: WorkflowInput<ShutdownPhase>,
        record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> PhaseResult<ShutdownPhase> {
        match record.state {
            EnvironmentState::Shutdown | EnvironmentState::Archived => {
                return Ok(ContinuationResult::succeeded());
            }
            EnvironmentState::Deleted => {
                return Ok(ContinuationResult::cancelled(reasons::INVALID_ENVIRONMENT_STATE));
            }
            _ => {}
        }

        if let Some(compute) = record.compute.clone() {
            attach(&mut input.compute, "compute", &compute)?;
        }
        if input.compute.is_none() {
            input = input.advance(ShutdownPhase::MarkShutdown)?;
        } else if input.force {
            input = input.advance(ShutdownPhase::ComputeDelete)?;
        }

        if input.current_state < ShutdownPhase::MarkShutdown && !record.state.is_invalid_or_failed() {
            record
                .update(|env| env.set_state(EnvironmentState::ShuttingDown))
                .await?;
        }

        let environment_id = input.environment_id;
        match input.current_state {
            ShutdownPhase::CheckComputeCleanupStatus => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    ));
                };
                match self.broker.status(environment_id, compute.resource_id).await {
                    Ok(state) => match state.cleanup {
                        Some(s) if s.is_pending() => {
                            Ok(ContinuationResult::in_progress_after(input, SHUTDOWN_POLL_RETRY))
                        }
                        Some(BrokerOperationStatus::Failed | BrokerOperationStatus::Cancelled) => {
                            warn!(%environment_id, "In-VM cleanup failed, deleting compute anyway");
                            Ok(ContinuationResult::in_progress(
                                input.advance(ShutdownPhase::ComputeDelete)?,
                            ))
                        }
                        // No cleanup requested, or it finished.
                        _ => Ok(ContinuationResult::in_progress(
                            input.advance(ShutdownPhase::ComputeDelete)?,
                        )),
                    },
                    Err(BrokerError::NotFound { .. }) => Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    )),
                    Err(e) => Err(e.into()),
                }
            }

            ShutdownPhase::ComputeDelete => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    ));
                };
                match self.broker.delete(environment_id, compute.resource_id).await {
                    Ok(()) => Ok(ContinuationResult::in_progress_after(
                        input.advance(ShutdownPhase::CheckComputeDeleteStatus)?,
                        SHUTDOWN_POLL_RETRY,
                    )),
                    Err(BrokerError::NotFound { .. }) => Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    )),
                    Err(BrokerError::Rejected(message)) => {
                        warn!(%environment_id, %message, "Compute delete rejected");
                        Ok(ContinuationResult::failed(reasons::FAILED_COMPUTE_DELETE))
                    }
                    Err(e) => Err(e.into()),
                }
            }

            ShutdownPhase::CheckComputeDeleteStatus => {
                let Some(compute) = input.compute.as_ref() else {
                    return Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    ));
                };
                match self.broker.status(environment_id, compute.resource_id).await {
                    Ok(_) => Ok(ContinuationResult::in_progress_after(input, SHUTDOWN_POLL_RETRY)),
                    Err(BrokerError::NotFound { .. }) => Ok(ContinuationResult::in_progress(
                        input.advance(ShutdownPhase::MarkShutdown)?,
                    )),
                    Err(e) => Err(e.into()),
                }
            }

            ShutdownPhase::MarkShutdown => {
                let archive_at = Utc::now()
                    + chrono::Duration::from_std(self.archive_after)
                        .unwrap_or(chrono::Duration::weeks(52));
                let written = record
                    .update(|env| {
                        env.compute = None;
                        env.scheduled_archival = Some(archive_at);
                        env.set_state(EnvironmentState::Shutdown);
                        true
                    })
                    .await;
                match written {
                    Ok(_) => {
                        info!(%environment_id, %archive_at, "Environment shut down");
                        Ok(ContinuationResult::succeeded())
                    }
                    Err(e) => {
                        warn!(%environment_id, error = %e, "Failed to mark environment shut down");
                        Ok(ContinuationResult::failed(
                            reasons::FAILED_TO_UPDATE_ENVIRONMENT_RECORD,
                        ))
                    }
                }
            }
        }
    }
}
