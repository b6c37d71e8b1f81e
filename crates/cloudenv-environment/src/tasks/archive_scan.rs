// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submits archival for environments that stayed shut down long enough.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloudenv_core::{ContinuationSubmitter, Identity, OperationState};
use tracing::{debug, warn};

use super::PeriodicTask;
use crate::error::Result;
use crate::handlers::{ArchivePhase, WorkflowInput};
use crate::model::{CloudEnvironment, EnvironmentOperation, EnvironmentState};
use crate::providers::{EnvironmentQuery, EnvironmentRepository};
use crate::target::EnvironmentTarget;

/// Reason recorded on archive workflows started by the scan.
pub const SCHEDULED_ARCHIVAL: &str = "ScheduledArchival";

/// How long an in-flight archival suppresses resubmission.
const IN_FLIGHT_WINDOW: Duration = Duration::from_secs(4 * 3600);

/// Finds shut-down environments whose archival is due.
pub struct ArchiveScanTask {
    repository: Arc<dyn EnvironmentRepository>,
    submitter: ContinuationSubmitter<EnvironmentTarget>,
    batch_size: usize,
}

impl ArchiveScanTask {
    /// Create the task.
    pub fn new(
        repository: Arc<dyn EnvironmentRepository>,
        submitter: ContinuationSubmitter<EnvironmentTarget>,
        batch_size: usize,
    ) -> Self {
        Self {
            repository,
            submitter,
            batch_size,
        }
    }
}

fn archival_in_flight(env: &CloudEnvironment) -> bool {
    env.transition(EnvironmentOperation::Archiving)
        .is_some_and(|t| {
            t.status == OperationState::InProgress
                && (Utc::now() - t.updated_at)
                    .to_std()
                    .is_ok_and(|age| age < IN_FLIGHT_WINDOW)
        })
}

#[async_trait]
impl PeriodicTask for ArchiveScanTask {
    fn name(&self) -> &'static str {
        "archive-scan"
    }

    async fn run_for_location(&self, location: &str, identity: &Identity) -> Result<usize> {
        let query = EnvironmentQuery {
            state: Some(EnvironmentState::Shutdown),
            location: Some(location.to_string()),
            archival_due_before: Some(Utc::now()),
            limit: Some(self.batch_size),
            ..Default::default()
        };
        let due = self.repository.list(&query, identity).await?;

        let mut submitted = 0;
        for env in due {
            if archival_in_flight(&env) {
                debug!(environment_id = %env.id, "Archival already in flight");
                continue;
            }
            let input =
                WorkflowInput::<ArchivePhase>::new(env.id, SCHEDULED_ARCHIVAL, env.last_state_updated);
            match self
                .submitter
                .submit_cross_region_as(
                    EnvironmentTarget::ArchiveEnvironment,
                    &env.location,
                    &input,
                    identity.clone(),
                )
                .await
            {
                Ok(_) => submitted += 1,
                Err(e) => warn!(environment_id = %env.id, error = %e, "Failed to submit archival"),
            }
        }
        Ok(submitted)
    }
}
