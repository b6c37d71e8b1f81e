// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease-guarded periodic tasks.
//!
//! Every instance of the service runs a [`TaskRunner`], but each `(task, location)`
//! pair runs at most once per claim period across the fleet: the runner obtains the
//! claimed lease `"{task}-{location}"` in [`TASK_LEASE_CONTAINER`] before running a
//! unit, and skips the unit when someone else already claimed the current window.
//!
//! Units run under the superuser identity.

use std::sync::Arc;

use async_trait::async_trait;
use cloudenv_core::{ClaimedLease, Identity, IdentityScope};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::error::Result;

mod archive_scan;
mod failed_scan;

pub use archive_scan::ArchiveScanTask;
pub use failed_scan::FailedEnvironmentScanTask;

/// Lease container shared by all periodic tasks.
pub const TASK_LEASE_CONTAINER: &str = "background-tasks";

/// One kind of periodic work, run per data-plane location.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Name, used in the lease name.
    fn name(&self) -> &'static str;

    /// Run once for `location`. Returns how many workflows were submitted.
    async fn run_for_location(&self, location: &str, identity: &Identity) -> Result<usize>;
}

/// Runs [`PeriodicTask`]s on a timer under claimed leases.
pub struct TaskRunner {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    lease: Arc<dyn ClaimedLease>,
    config: TaskConfig,
    scope: IdentityScope,
    shutdown: Arc<Notify>,
}

impl TaskRunner {
    /// Create a runner with no tasks.
    pub fn new(lease: Arc<dyn ClaimedLease>, config: TaskConfig) -> Self {
        Self {
            tasks: Vec::new(),
            lease,
            config,
            scope: IdentityScope::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Add a task.
    pub fn with_task(mut self, task: Arc<dyn PeriodicTask>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Identity scope units run in.
    pub fn with_scope(mut self, scope: IdentityScope) -> Self {
        self.scope = scope;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tick until shutdown. A unit already running finishes first.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Periodic tasks disabled");
            return;
        }

        info!(
            tasks = self.tasks.len(),
            locations = ?self.config.data_plane_locations,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            claim_period_secs = self.config.claim_period.as_secs(),
            "Periodic task runner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Periodic task runner shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let units = self.run_once().await;
                    debug!(units, "Periodic task tick complete");
                }
            }
        }
    }

    /// Run every task for every location whose lease can be claimed. Returns the
    /// number of units that ran.
    pub async fn run_once(&self) -> usize {
        let mut units = 0;
        for task in &self.tasks {
            for location in &self.config.data_plane_locations {
                if self.run_unit(task.as_ref(), location).await {
                    units += 1;
                }
            }
        }
        units
    }

    async fn run_unit(&self, task: &dyn PeriodicTask, location: &str) -> bool {
        let lease_name = format!("{}-{}", task.name(), location);
        let guard = match self
            .lease
            .obtain(TASK_LEASE_CONTAINER, &lease_name, Some(self.config.claim_period))
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(task = task.name(), location, "Task already claimed for this period");
                return false;
            }
            Err(e) => {
                warn!(task = task.name(), location, error = %e, "Failed to obtain task lease");
                return false;
            }
        };

        let identity = Identity::Superuser;
        {
            let _elevated = self.scope.enter(identity.clone());
            match task.run_for_location(location, &identity).await {
                Ok(submitted) => info!(task = task.name(), location, submitted, "Task unit complete"),
                Err(e) => error!(task = task.name(), location, error = %e, "Task unit failed"),
            }
        }

        if let Err(e) = guard.release().await {
            warn!(task = task.name(), location, error = %e, "Failed to release task lease");
        }
        true
    }
}
