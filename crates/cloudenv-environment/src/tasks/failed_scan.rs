// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletes environments that stayed failed past the grace period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloudenv_core::{ContinuationSubmitter, Identity};
use tracing::warn;

use super::PeriodicTask;
use crate::error::Result;
use crate::handlers::DeleteEnvironmentInput;
use crate::model::EnvironmentState;
use crate::providers::{EnvironmentQuery, EnvironmentRepository};
use crate::target::EnvironmentTarget;

/// Reason recorded on delete workflows started by the scan.
pub const FAILED_ENVIRONMENT_CLEANUP: &str = "FailedEnvironmentCleanup";

/// Finds failed environments to delete.
pub struct FailedEnvironmentScanTask {
    repository: Arc<dyn EnvironmentRepository>,
    submitter: ContinuationSubmitter<EnvironmentTarget>,
    grace: Duration,
    batch_size: usize,
}

impl FailedEnvironmentScanTask {
    /// Create the task. Environments are deleted once failed for longer than `grace`.
    pub fn new(
        repository: Arc<dyn EnvironmentRepository>,
        submitter: ContinuationSubmitter<EnvironmentTarget>,
        grace: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            repository,
            submitter,
            grace,
            batch_size,
        }
    }
}

#[async_trait]
impl PeriodicTask for FailedEnvironmentScanTask {
    fn name(&self) -> &'static str {
        "failed-environment-scan"
    }

    async fn run_for_location(&self, location: &str, identity: &Identity) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let query = EnvironmentQuery {
            state: Some(EnvironmentState::Failed),
            location: Some(location.to_string()),
            state_updated_before: Some(Utc::now() - grace),
            limit: Some(self.batch_size),
            ..Default::default()
        };
        let expired = self.repository.list(&query, identity).await?;

        let mut submitted = 0;
        for env in expired {
            let input = DeleteEnvironmentInput::for_environment(&env, FAILED_ENVIRONMENT_CLEANUP);
            match self
                .submitter
                .submit_cross_region_as(
                    EnvironmentTarget::DeleteEnvironment,
                    &env.location,
                    &input,
                    identity.clone(),
                )
                .await
            {
                Ok(_) => submitted += 1,
                Err(e) => warn!(environment_id = %env.id, error = %e, "Failed to submit deletion"),
            }
        }
        Ok(submitted)
    }
}
