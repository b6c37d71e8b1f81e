// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase handlers for the environment lifecycle.
//!
//! | Target | Handler | Shape |
//! |--------|---------|-------|
//! | `create-environment` | [`CreateEnvironmentHandler`] | 5 phases |
//! | `start-environment` | [`StartEnvironmentHandler`] | 7 phases |
//! | `export-environment` | [`StartEnvironmentHandler`] | 7 phases, export boot |
//! | `shutdown-environment` | [`ShutdownEnvironmentHandler`] | 4 phases |
//! | `archive-environment` | [`ArchiveEnvironmentHandler`] | 4 phases, superuser |
//! | `suspend-environment` | [`SuspendEnvironmentHandler`] | single shot, superuser |
//! | `delete-environment` | [`DeleteEnvironmentHandler`] | single shot, superuser |
//! | `repair-environment` | [`RepairEnvironmentHandler`] | single shot, superuser |

use std::sync::Arc;
use std::time::Duration;

use cloudenv_core::{ContinuationSubmitter, HandlerRegistryBuilder};

use crate::providers::{
    EnvironmentManager, EnvironmentMonitor, EnvironmentRepository, HeartbeatRepository,
    ResourceBroker,
};
use crate::target::EnvironmentTarget;

mod archive;
mod base;
mod create;
mod delete;
mod phase;
mod provisioning;
mod record;
mod repair;
mod shutdown;
mod start;
mod suspend;

pub use archive::{
    ARCHIVE_POLL_RETRY, ArchiveEnvironmentHandler, ArchiveEnvironmentWorkflow, ArchivePhase,
};
pub use base::{EnvironmentWorkflow, PhaseResult, WORKFLOW_AGE_SLACK, WorkflowHandler};
pub use create::{CreateEnvironmentHandler, CreateEnvironmentWorkflow, CreatePhase};
pub use delete::{DeleteEnvironmentHandler, DeleteEnvironmentInput};
pub use phase::{Phase, PhaseRegression, ResourceConflict, WorkflowInput, attach, total_budget};
pub use provisioning::{Probe, RESOURCE_STATE_RETRY, START_COMPUTE_RETRY};
pub use record::{EnvironmentRecord, MAX_UPDATE_ATTEMPTS};
pub use repair::{RepairEnvironmentHandler, RepairEnvironmentInput};
pub use shutdown::{SHUTDOWN_POLL_RETRY, ShutdownEnvironmentHandler, ShutdownEnvironmentWorkflow, ShutdownPhase};
pub use start::{StartEnvironmentHandler, StartEnvironmentWorkflow, StartKind, StartPhase};
pub use suspend::{SuspendEnvironmentHandler, SuspendEnvironmentInput};

/// Failure and cancellation reasons reported by the handlers.
pub mod reasons {
    /// The environment record does not exist.
    pub const ENVIRONMENT_NOT_FOUND: &str = "EnvironmentNotFound";
    /// The acting identity may not touch the environment.
    pub const ACCESS_DENIED: &str = "AccessDenied";
    /// A polling phase outlived its budget.
    pub const TIMEOUT: &str = "Timeout";
    /// The environment is in a state the workflow cannot run from.
    pub const INVALID_ENVIRONMENT_STATE: &str = "InvalidEnvironmentState";

    /// The broker refused or mangled an allocation.
    pub const INVALID_COMPUTE_ALLOCATION: &str = "InvalidComputeAllocation";
    /// Compute failed to provision.
    pub const INVALID_COMPUTE_RESOURCE_STATE: &str = "InvalidComputeResourceState";
    /// OS disk failed to provision.
    pub const INVALID_OS_DISK_RESOURCE_STATE: &str = "InvalidOSDiskResourceState";
    /// Storage failed to provision.
    pub const INVALID_STORAGE_RESOURCE_STATE: &str = "InvalidStorageResourceState";
    /// The broker refused to start the compute.
    pub const INVALID_START_COMPUTE: &str = "InvalidStartCompute";
    /// The compute failed to boot.
    pub const INVALID_START_COMPUTE_STATE: &str = "InvalidStartComputeState";

    /// Start requested for a failed, deleted or unavailable environment.
    pub const FAILED_ENVIRONMENT_START_STATE: &str = "FailedEnvironmentStartState";
    /// The OS disk of a stopped environment is gone or unusable.
    pub const FAILED_TO_GET_OS_DISK_RESOURCE: &str = "FailedToGetOSDiskResource";
    /// The storage of a stopped environment is gone or unusable.
    pub const FAILED_TO_GET_STORAGE_RESOURCE: &str = "FailedToGetStorageResource";

    /// The broker refused to delete the compute.
    pub const FAILED_COMPUTE_DELETE: &str = "FailedComputeDelete";
    /// The final shutdown write failed.
    pub const FAILED_TO_UPDATE_ENVIRONMENT_RECORD: &str = "FailedToUpdateEnvironmentRecord";

    /// The environment changed since archival was scheduled.
    pub const ENVIRONMENT_STATE_CHANGED: &str = "EnvironmentStateChanged";
    /// Archive blob allocation failed.
    pub const INVALID_BLOB_STORAGE_ALLOCATE: &str = "InvalidBlobStorageAllocate";
    /// The copy into the archive blob could not be started.
    pub const INVALID_BLOB_STORAGE_START: &str = "InvalidBlobStorageStart";
    /// The copy into the archive blob failed.
    pub const INVALID_BLOB_STORAGE_START_STATUS: &str = "InvalidBlobStorageStartStatus";
    /// Storage could not be swapped to the archive blob.
    pub const FAILED_STORAGE_SWAP: &str = "FailedStorageSwap";
    /// The old file share could not be deleted.
    pub const FAILED_STORAGE_DELETE: &str = "FailedStorageDelete";

    /// Suspend did not report success.
    pub const SUSPENSION_FAILED: &str = "SuspensionFailed";
    /// A resource could not be deleted.
    pub const DELETION_FAILED: &str = "DeletionFailed";
    /// Forced suspend did not report success.
    pub const REPAIR_FAILED: &str = "RepairFailed";
}

/// Everything the handlers call out to.
#[derive(Clone)]
pub struct Collaborators {
    /// Environment store.
    pub repository: Arc<dyn EnvironmentRepository>,
    /// Resource broker.
    pub broker: Arc<dyn ResourceBroker>,
    /// Heartbeat store.
    pub heartbeats: Arc<dyn HeartbeatRepository>,
    /// Heartbeat monitor.
    pub monitor: Arc<dyn EnvironmentMonitor>,
    /// Environment manager.
    pub manager: Arc<dyn EnvironmentManager>,
}

/// Register one handler per [`EnvironmentTarget`].
///
/// `submitter` is handed to workflows that start other workflows (create's cleanup).
/// Because the activator owns the submitter, build the submitter first, register the
/// handlers, then build the activator around the same submitter.
pub fn register_all(
    builder: HandlerRegistryBuilder<EnvironmentTarget>,
    collaborators: &Collaborators,
    submitter: ContinuationSubmitter<EnvironmentTarget>,
    archive_after: Duration,
) -> HandlerRegistryBuilder<EnvironmentTarget> {
    let c = collaborators;
    builder
        .register(CreateEnvironmentHandler::new(
            CreateEnvironmentWorkflow::new(c, submitter),
            Arc::clone(&c.repository),
        ))
        .register(StartEnvironmentHandler::new(
            StartEnvironmentWorkflow::new(c, StartKind::Resume),
            Arc::clone(&c.repository),
        ))
        .register(StartEnvironmentHandler::new(
            StartEnvironmentWorkflow::new(c, StartKind::Export),
            Arc::clone(&c.repository),
        ))
        .register(ShutdownEnvironmentHandler::new(
            ShutdownEnvironmentWorkflow::new(c, archive_after),
            Arc::clone(&c.repository),
        ))
        .register(ArchiveEnvironmentHandler::new(
            ArchiveEnvironmentWorkflow::new(c),
            Arc::clone(&c.repository),
        ))
        .register(SuspendEnvironmentHandler::new(Arc::clone(&c.manager)))
        .register(DeleteEnvironmentHandler::new(
            Arc::clone(&c.broker),
            Arc::clone(&c.repository),
        ))
        .register(RepairEnvironmentHandler::new(Arc::clone(&c.manager)))
}
