// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators the workflows drive.
//!
//! Handlers talk to infrastructure only through these traits: the resource broker that
//! owns VMs, disks and storage, the environment repository, heartbeat storage, the
//! heartbeat monitor and the environment manager. Production adapters and the
//! [`crate::mock`] implementations plug in here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudenv_core::{Identity, OperationState, ResourceRef, ResourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{CloudEnvironment, EnvironmentState};

// ============================================================================
// Resource broker
// ============================================================================

/// Status of one broker-side operation on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOperationStatus {
    /// Accepted, not started.
    Initialized,
    /// Running.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
    /// Abandoned.
    Cancelled,
}

impl BrokerOperationStatus {
    /// Still running or about to.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Initialized | Self::InProgress)
    }
}

/// What the broker knows about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    /// Resource id.
    pub resource_id: Uuid,
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// Allocation progress.
    pub provisioning: BrokerOperationStatus,
    /// Progress of the last start action, if any.
    pub starting: Option<BrokerOperationStatus>,
    /// Progress of in-VM cleanup before release, if any.
    pub cleanup: Option<BrokerOperationStatus>,
}

impl ResourceState {
    /// Allocated and usable.
    pub fn is_ready(&self) -> bool {
        self.provisioning == BrokerOperationStatus::Succeeded
    }
}

/// One resource to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateRequest {
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// Data-plane location.
    pub location: String,
    /// Size/class.
    pub sku_name: String,
}

impl AllocateRequest {
    /// Build a request.
    pub fn new(resource_type: ResourceType, location: &str, sku_name: &str) -> Self {
        Self {
            resource_type,
            location: location.to_string(),
            sku_name: sku_name.to_string(),
        }
    }
}

/// Actions the broker can start on a set of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    /// Boot the environment for use.
    StartCompute,
    /// Boot the environment to export it.
    StartExport,
    /// Copy storage into an archive blob.
    StartArchive,
}

/// Resource broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker has no such resource.
    #[error("resource {resource_id} not found")]
    NotFound {
        /// Missing resource.
        resource_id: Uuid,
    },

    /// The broker is briefly unavailable.
    #[error("resource broker unavailable: {message}")]
    Unavailable {
        /// Suggested delay before retrying.
        retry_after: Duration,
        /// Details.
        message: String,
    },

    /// The broker refused the request.
    #[error("resource broker rejected request: {0}")]
    Rejected(String),
}

/// Allocates and operates infrastructure resources.
#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Allocate resources for an environment. Returns one reference per request.
    async fn allocate(
        &self,
        environment_id: Uuid,
        requests: &[AllocateRequest],
    ) -> Result<Vec<ResourceRef>, BrokerError>;

    /// Current state of a resource.
    async fn status(&self, environment_id: Uuid, resource_id: Uuid) -> Result<ResourceState, BrokerError>;

    /// Start an action across resources. Repeating a started action is harmless.
    async fn start(
        &self,
        environment_id: Uuid,
        action: StartAction,
        resources: &[Uuid],
    ) -> Result<(), BrokerError>;

    /// Delete a resource.
    async fn delete(&self, environment_id: Uuid, resource_id: Uuid) -> Result<(), BrokerError>;
}

// ============================================================================
// Environment repository
// ============================================================================

/// Environment repository failures.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No such environment.
    #[error("environment {0} not found")]
    NotFound(Uuid),

    /// The stored version moved on since the record was read.
    #[error("environment {id} was modified concurrently (expected version {expected_version})")]
    Conflict {
        /// Environment id.
        id: Uuid,
        /// Version the writer read.
        expected_version: i64,
    },

    /// The identity may not access the environment.
    #[error("access to environment {0} denied")]
    Forbidden(Uuid),

    /// Storage failure.
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Filter for [`EnvironmentRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct EnvironmentQuery {
    /// Only environments in this state.
    pub state: Option<EnvironmentState>,
    /// Only environments in this data-plane location.
    pub location: Option<String>,
    /// Only environments scheduled for archival at or before this time.
    pub archival_due_before: Option<DateTime<Utc>>,
    /// Only environments whose state last changed before this time.
    pub state_updated_before: Option<DateTime<Utc>>,
    /// Maximum results.
    pub limit: Option<usize>,
}

impl EnvironmentQuery {
    /// Whether `env` passes the filter, ignoring `limit`.
    pub fn matches(&self, env: &CloudEnvironment) -> bool {
        self.state.is_none_or(|s| env.state == s)
            && self.location.as_deref().is_none_or(|l| env.location == l)
            && self
                .archival_due_before
                .is_none_or(|due| env.scheduled_archival.is_some_and(|at| at <= due))
            && self
                .state_updated_before
                .is_none_or(|before| env.last_state_updated < before)
    }
}

/// Stores environment aggregates.
///
/// Every call carries the acting identity. Updates are compare-and-swap on
/// [`CloudEnvironment::version`].
#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    /// Fetch an environment. `Ok(None)` when it does not exist.
    async fn get(&self, id: Uuid, identity: &Identity) -> Result<Option<CloudEnvironment>, RepositoryError>;

    /// Insert a new environment.
    async fn create(
        &self,
        environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError>;

    /// Replace an environment if its stored version still equals `environment.version`.
    /// Returns the stored record with its new version.
    async fn update(
        &self,
        environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError>;

    /// List environments matching `query`.
    async fn list(
        &self,
        query: &EnvironmentQuery,
        identity: &Identity,
    ) -> Result<Vec<CloudEnvironment>, RepositoryError>;
}

// ============================================================================
// Heartbeats, monitoring and management
// ============================================================================

/// Failures of the heartbeat and management collaborators.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Briefly unavailable.
    #[error("provider unavailable: {message}")]
    Unavailable {
        /// Suggested delay before retrying.
        retry_after: Duration,
        /// Details.
        message: String,
    },

    /// The call failed.
    #[error("provider call failed: {0}")]
    Failed(String),
}

/// Stores heartbeat records.
#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Heartbeat record of an environment, if one exists.
    async fn find(&self, environment_id: Uuid) -> Result<Option<Uuid>, ProviderError>;

    /// Create a heartbeat record for an environment.
    async fn create(&self, environment_id: Uuid) -> Result<Uuid, ProviderError>;
}

/// Watches heartbeats of running environments.
#[async_trait]
pub trait EnvironmentMonitor: Send + Sync {
    /// Start expecting heartbeats from `compute_id`.
    async fn monitor_heartbeat(&self, environment_id: Uuid, compute_id: Uuid) -> Result<(), ProviderError>;
}

/// Higher-level environment operations.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Suspend an environment gracefully.
    async fn suspend(&self, environment_id: Uuid, identity: &Identity) -> Result<OperationState, ProviderError>;

    /// Suspend an environment regardless of its health.
    async fn force_suspend(
        &self,
        environment_id: Uuid,
        identity: &Identity,
    ) -> Result<OperationState, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matches_filters() {
        let mut env = CloudEnvironment::new("u1", "dev", "westus2", "basicLinux");
        env.state = EnvironmentState::Shutdown;
        env.scheduled_archival = Some(Utc::now() - chrono::Duration::hours(1));

        let due = EnvironmentQuery {
            state: Some(EnvironmentState::Shutdown),
            location: Some("westus2".into()),
            archival_due_before: Some(Utc::now()),
            ..Default::default()
        };
        assert!(due.matches(&env));

        let elsewhere = EnvironmentQuery {
            location: Some("eastus".into()),
            ..Default::default()
        };
        assert!(!elsewhere.matches(&env));

        env.scheduled_archival = None;
        assert!(!due.matches(&env));
    }

    #[test]
    fn test_pending_statuses() {
        assert!(BrokerOperationStatus::Initialized.is_pending());
        assert!(BrokerOperationStatus::InProgress.is_pending());
        assert!(!BrokerOperationStatus::Succeeded.is_pending());
    }
}
