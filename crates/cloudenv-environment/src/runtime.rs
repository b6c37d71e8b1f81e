// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cloudenv-environment.
//!
//! [`EnvironmentRuntime`] wires the environment workflows into a continuation
//! worker and starts the periodic scans, inside an existing tokio application.
//!
//! ```rust,ignore
//! use cloudenv_environment::config::Config;
//! use cloudenv_environment::runtime::EnvironmentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = sqlx::PgPool::connect(config.core.database_url.as_deref().unwrap()).await?;
//!     cloudenv_environment::migrations::run(&pool).await?;
//!
//!     let runtime = EnvironmentRuntime::builder()
//!         .config(config)
//!         .collaborators(collaborators)
//!         .postgres(pool)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.submitter().submit(target, &input).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::{Result, anyhow};
use cloudenv_core::{
    ClaimedLease, ContinuationActivator, ContinuationQueue, ContinuationSubmitter,
    ContinuationWorker, CrossRegionQueue, Dispatcher, HandlerRegistry, InMemoryLease,
    InMemoryQueue, PostgresLease, PostgresQueue,
};
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::{self, Collaborators};
use crate::target::EnvironmentTarget;
use crate::tasks::{ArchiveScanTask, FailedEnvironmentScanTask, TaskRunner};

/// Builder for creating an [`EnvironmentRuntime`].
#[derive(Default)]
pub struct EnvironmentRuntimeBuilder {
    config: Option<Config>,
    collaborators: Option<Collaborators>,
    queue: Option<Arc<dyn ContinuationQueue<EnvironmentTarget>>>,
    cross_region: Option<Arc<dyn CrossRegionQueue<EnvironmentTarget>>>,
    lease: Option<Arc<dyn ClaimedLease>>,
}

impl EnvironmentRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the repositories and providers the workflows call (required).
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Queue for this region.
    ///
    /// Default: an in-memory queue.
    pub fn queue(mut self, queue: Arc<dyn ContinuationQueue<EnvironmentTarget>>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Queues of other regions, for environments whose location belongs elsewhere.
    ///
    /// Without one, every submission lands on the local queue.
    pub fn cross_region(mut self, cross_region: Arc<dyn CrossRegionQueue<EnvironmentTarget>>) -> Self {
        self.cross_region = Some(cross_region);
        self
    }

    /// Lease store for the periodic tasks.
    ///
    /// Default: an in-memory lease, which only coordinates within this process.
    pub fn lease(mut self, lease: Arc<dyn ClaimedLease>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Use PostgreSQL for the queue and the task lease. The queue is named after
    /// the configured region, so call this after [`config`](Self::config).
    pub fn postgres(mut self, pool: PgPool) -> Self {
        let queue_name = self
            .config
            .as_ref()
            .map(|c| c.core.region.clone())
            .unwrap_or_else(|| "default".to_string());
        self.queue = Some(Arc::new(PostgresQueue::new(pool.clone(), queue_name)));
        self.lease = Some(Arc::new(PostgresLease::new(pool)));
        self
    }

    /// Build the runtime. Fails if a required piece is missing or a workflow
    /// target has no handler.
    pub fn build(self) -> Result<EnvironmentRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow!("config is required"))?;
        let collaborators = self
            .collaborators
            .ok_or_else(|| anyhow!("collaborators are required"))?;
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new()));
        let lease = self
            .lease
            .unwrap_or_else(|| Arc::new(InMemoryLease::new()));

        let mut submitter = ContinuationSubmitter::new(queue, Arc::new(config.region_map()));
        if let Some(cross_region) = self.cross_region {
            submitter = submitter.with_cross_region(cross_region);
        }

        let registry = handlers::register_all(
            HandlerRegistry::builder(),
            &collaborators,
            submitter.clone(),
            config.archive_after,
        )
        .build()?;

        let dispatcher = Dispatcher::new(Arc::new(registry))
            .with_max_workflow_age(config.core.max_workflow_age);
        let activator = Arc::new(
            ContinuationActivator::new(dispatcher, submitter.clone())
                .with_fault_policy(config.core.fault_retry.clone()),
        );

        let tasks = TaskRunner::new(lease, config.tasks.clone())
            .with_task(Arc::new(ArchiveScanTask::new(
                collaborators.repository.clone(),
                submitter.clone(),
                config.tasks.batch_size,
            )))
            .with_task(Arc::new(FailedEnvironmentScanTask::new(
                collaborators.repository.clone(),
                submitter.clone(),
                config.tasks.failed_grace,
                config.tasks.batch_size,
            )));

        Ok(EnvironmentRuntimeConfig {
            config,
            submitter,
            activator,
            tasks,
        })
    }
}

/// A built runtime, ready to [`start`](Self::start).
pub struct EnvironmentRuntimeConfig {
    config: Config,
    submitter: ContinuationSubmitter<EnvironmentTarget>,
    activator: Arc<ContinuationActivator<EnvironmentTarget>>,
    tasks: TaskRunner,
}

impl EnvironmentRuntimeConfig {
    /// Submitter for starting workflows.
    pub fn submitter(&self) -> &ContinuationSubmitter<EnvironmentTarget> {
        &self.submitter
    }

    /// The activator, for driving continuations without a worker.
    pub fn activator(&self) -> &Arc<ContinuationActivator<EnvironmentTarget>> {
        &self.activator
    }

    /// Spawn the continuation worker and the periodic task runner.
    pub async fn start(self) -> Result<EnvironmentRuntime> {
        info!(
            region = %self.config.core.region,
            concurrency = self.config.core.worker.concurrency,
            tasks_enabled = self.config.tasks.enabled,
            "Starting EnvironmentRuntime"
        );

        let worker = ContinuationWorker::new(self.activator.clone(), self.config.core.worker.clone());
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move { worker.run().await });

        let tasks = self.tasks;
        let tasks_shutdown = tasks.shutdown_handle();
        let tasks_handle = tokio::spawn(async move { tasks.run().await });

        Ok(EnvironmentRuntime {
            submitter: self.submitter,
            activator: self.activator,
            worker_shutdown,
            worker_handle,
            tasks_shutdown,
            tasks_handle,
        })
    }
}

/// A running environment service.
pub struct EnvironmentRuntime {
    submitter: ContinuationSubmitter<EnvironmentTarget>,
    activator: Arc<ContinuationActivator<EnvironmentTarget>>,
    worker_shutdown: Arc<Notify>,
    worker_handle: JoinHandle<()>,
    tasks_shutdown: Arc<Notify>,
    tasks_handle: JoinHandle<()>,
}

impl EnvironmentRuntime {
    /// Create a new builder.
    pub fn builder() -> EnvironmentRuntimeBuilder {
        EnvironmentRuntimeBuilder::new()
    }

    /// Submitter for starting workflows.
    pub fn submitter(&self) -> &ContinuationSubmitter<EnvironmentTarget> {
        &self.submitter
    }

    /// The activator the worker drives.
    pub fn activator(&self) -> &Arc<ContinuationActivator<EnvironmentTarget>> {
        &self.activator
    }

    /// Whether the worker is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }

    /// Stop the worker and the task runner. Steps already running finish first.
    pub async fn shutdown(self) -> Result<()> {
        info!("EnvironmentRuntime shutting down...");

        self.worker_shutdown.notify_one();
        self.tasks_shutdown.notify_one();

        let mut result = Ok(());
        if let Err(e) = self.worker_handle.await {
            error!("Continuation worker task panicked: {}", e);
            result = Err(anyhow!("worker task panicked: {}", e));
        }
        if let Err(e) = self.tasks_handle.await {
            error!("Periodic task runner panicked: {}", e);
            result = Err(anyhow!("task runner panicked: {}", e));
        }

        info!("EnvironmentRuntime shutdown complete");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockCollaborators;

    fn config() -> Config {
        let mut core = cloudenv_core::Config {
            region: "westus2".to_string(),
            database_url: None,
            worker: Default::default(),
            max_workflow_age: Duration::from_secs(3600),
            fault_retry: Default::default(),
        };
        core.worker.poll_interval = Duration::from_millis(10);
        Config {
            core,
            location_regions: vec![("westus2".into(), "westus2".into())],
            archive_after: Duration::from_secs(3600),
            tasks: Default::default(),
        }
    }

    #[test]
    fn test_build_requires_collaborators() {
        let err = EnvironmentRuntime::builder().config(config()).build().err().unwrap();
        assert!(err.to_string().contains("collaborators"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mocks = MockCollaborators::default();
        let runtime = EnvironmentRuntime::builder()
            .config(config())
            .collaborators(mocks.collaborators())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
