// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The cloud environment aggregate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cloudenv_core::{OperationState, ResourceRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// Record exists, nothing allocated yet.
    Created,
    /// Resources are being allocated.
    Provisioning,
    /// Compute is being started.
    Starting,
    /// Running and reachable.
    Available,
    /// Running to export its contents.
    Exporting,
    /// Compute is being released.
    ShuttingDown,
    /// Compute released, storage kept.
    Shutdown,
    /// Storage moved to cold storage.
    Archived,
    /// A workflow failed irrecoverably.
    Failed,
    /// All resources deleted.
    Deleted,
    /// Unhealthy; needs repair.
    Unavailable,
}

impl EnvironmentState {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Available => "available",
            Self::Exporting => "exporting",
            Self::ShuttingDown => "shutting_down",
            Self::Shutdown => "shutdown",
            Self::Archived => "archived",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::Unavailable => "unavailable",
        }
    }

    /// States no start or export may proceed from.
    pub fn is_invalid_or_failed(self) -> bool {
        matches!(self, Self::Failed | Self::Deleted | Self::Unavailable)
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "provisioning" => Ok(Self::Provisioning),
            "starting" => Ok(Self::Starting),
            "available" => Ok(Self::Available),
            "exporting" => Ok(Self::Exporting),
            "shutting_down" => Ok(Self::ShuttingDown),
            "shutdown" => Ok(Self::Shutdown),
            "archived" => Ok(Self::Archived),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            "unavailable" => Ok(Self::Unavailable),
            other => Err(format!("unknown environment state '{other}'")),
        }
    }
}

/// Operations whose progress is tracked on the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentOperation {
    /// Initial provisioning.
    Provisioning,
    /// Resuming.
    Resuming,
    /// Exporting.
    Exporting,
    /// Shutting down.
    ShuttingDown,
    /// Archiving.
    Archiving,
    /// Deleting.
    Deleting,
}

impl EnvironmentOperation {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Resuming => "resuming",
            Self::Exporting => "exporting",
            Self::ShuttingDown => "shutting_down",
            Self::Archiving => "archiving",
            Self::Deleting => "deleting",
        }
    }
}

/// Last known status of one operation on the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionState {
    /// Status of the operation.
    pub status: OperationState,
    /// Reason for failed and cancelled outcomes.
    pub reason: Option<String>,
    /// Workflow run that reported it.
    pub tracking_id: Uuid,
    /// When it was reported.
    pub updated_at: DateTime<Utc>,
}

/// A tenant's cloud development environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEnvironment {
    /// Environment id.
    pub id: Uuid,
    /// Owning user.
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle state.
    pub state: EnvironmentState,
    /// Data-plane location.
    pub location: String,
    /// Size/class of the environment.
    pub sku_name: String,
    /// Virtual machine, while one is allocated.
    pub compute: Option<ResourceRef>,
    /// OS disk.
    pub os_disk: Option<ResourceRef>,
    /// Workspace storage: a file share, or an archive blob once archived.
    pub storage: Option<ResourceRef>,
    /// Archive blob allocated but not yet swapped in.
    pub pending_archive: Option<ResourceRef>,
    /// Heartbeat record id.
    pub heartbeat_id: Option<Uuid>,
    /// When `state` last changed.
    pub last_state_updated: DateTime<Utc>,
    /// When a shut-down environment becomes eligible for archival.
    pub scheduled_archival: Option<DateTime<Utc>>,
    /// Per-operation progress.
    #[serde(default)]
    pub transitions: BTreeMap<EnvironmentOperation, TransitionState>,
    /// Optimistic concurrency token, bumped by every successful update.
    #[serde(default)]
    pub version: i64,
}

impl CloudEnvironment {
    /// A freshly created environment with nothing allocated.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
        sku_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            state: EnvironmentState::Created,
            location: location.into(),
            sku_name: sku_name.into(),
            compute: None,
            os_disk: None,
            storage: None,
            pending_archive: None,
            heartbeat_id: None,
            last_state_updated: Utc::now(),
            scheduled_archival: None,
            transitions: BTreeMap::new(),
            version: 0,
        }
    }

    /// Move to `state`, stamping `last_state_updated`. Returns whether it changed.
    pub fn set_state(&mut self, state: EnvironmentState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.last_state_updated = Utc::now();
        true
    }

    /// Record an operation's status. Returns whether anything changed.
    pub fn record_transition(
        &mut self,
        operation: EnvironmentOperation,
        status: OperationState,
        reason: Option<&str>,
        tracking_id: Uuid,
    ) -> bool {
        if let Some(existing) = self.transitions.get(&operation)
            && existing.status == status
            && existing.reason.as_deref() == reason
            && existing.tracking_id == tracking_id
        {
            return false;
        }
        self.transitions.insert(
            operation,
            TransitionState {
                status,
                reason: reason.map(str::to_string),
                tracking_id,
                updated_at: Utc::now(),
            },
        );
        true
    }

    /// Last recorded status of `operation`.
    pub fn transition(&self, operation: EnvironmentOperation) -> Option<&TransitionState> {
        self.transitions.get(&operation)
    }
}
