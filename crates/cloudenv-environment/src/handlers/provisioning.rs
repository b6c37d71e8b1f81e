// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker probes shared by the create and start workflows.

use std::time::Duration;

use cloudenv_core::{ResourceRef, ResourceType};
use uuid::Uuid;

use super::reasons;
use crate::error::Result;
use crate::providers::{
    BrokerError, BrokerOperationStatus, HeartbeatRepository, ResourceBroker, StartAction,
};

/// Poll interval while resources are being allocated.
pub const RESOURCE_STATE_RETRY: Duration = Duration::from_secs(10);

/// Poll interval while compute is booting.
pub const START_COMPUTE_RETRY: Duration = Duration::from_secs(1);

/// Outcome of a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Done; move on.
    Ready,
    /// Still running; poll again.
    Pending,
    /// Will not succeed.
    Failed(&'static str),
}

fn not_ready_reason(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::ComputeVm => reasons::INVALID_COMPUTE_RESOURCE_STATE,
        ResourceType::OsDisk | ResourceType::Snapshot => reasons::INVALID_OS_DISK_RESOURCE_STATE,
        ResourceType::StorageFileShare | ResourceType::StorageArchive => {
            reasons::INVALID_STORAGE_RESOURCE_STATE
        }
    }
}

/// Pick the reference of `resource_type` out of an allocation response.
pub fn find(refs: &[ResourceRef], resource_type: ResourceType) -> Option<&ResourceRef> {
    refs.iter().find(|r| r.resource_type == resource_type)
}

/// Whether every resource finished allocating.
pub async fn probe_resources(
    broker: &dyn ResourceBroker,
    environment_id: Uuid,
    resources: &[&ResourceRef],
) -> Result<Probe> {
    let mut pending = false;
    for resource in resources {
        match broker.status(environment_id, resource.resource_id).await {
            Ok(state) => match state.provisioning {
                BrokerOperationStatus::Succeeded => {}
                s if s.is_pending() => pending = true,
                _ => return Ok(Probe::Failed(not_ready_reason(resource.resource_type))),
            },
            Err(BrokerError::NotFound { .. }) => {
                return Ok(Probe::Failed(not_ready_reason(resource.resource_type)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(if pending { Probe::Pending } else { Probe::Ready })
}

/// Ask the broker to start `action` on `resources` unless the compute already runs it.
/// Returns a failure reason when the broker refuses.
pub async fn start_compute(
    broker: &dyn ResourceBroker,
    environment_id: Uuid,
    action: StartAction,
    compute: &ResourceRef,
    resources: &[Uuid],
) -> Result<Option<&'static str>> {
    match broker.status(environment_id, compute.resource_id).await {
        Ok(state)
            if state
                .starting
                .is_some_and(|s| s.is_pending() || s == BrokerOperationStatus::Succeeded) =>
        {
            return Ok(None);
        }
        Ok(_) => {}
        Err(BrokerError::NotFound { .. }) => return Ok(Some(reasons::INVALID_START_COMPUTE)),
        Err(e) => return Err(e.into()),
    }

    match broker.start(environment_id, action, resources).await {
        Ok(()) => Ok(None),
        Err(BrokerError::Rejected(_) | BrokerError::NotFound { .. }) => {
            Ok(Some(reasons::INVALID_START_COMPUTE))
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether the compute finished booting.
pub async fn probe_start(
    broker: &dyn ResourceBroker,
    environment_id: Uuid,
    compute: &ResourceRef,
) -> Result<Probe> {
    match broker.status(environment_id, compute.resource_id).await {
        Ok(state) => Ok(match state.starting {
            Some(BrokerOperationStatus::Succeeded) => Probe::Ready,
            None => Probe::Pending,
            Some(s) if s.is_pending() => Probe::Pending,
            Some(_) => Probe::Failed(reasons::INVALID_START_COMPUTE_STATE),
        }),
        Err(BrokerError::NotFound { .. }) => Ok(Probe::Failed(reasons::INVALID_START_COMPUTE_STATE)),
        Err(e) => Err(e.into()),
    }
}

/// Heartbeat record id for an environment, creating the record when missing.
pub async fn ensure_heartbeat(
    heartbeats: &dyn HeartbeatRepository,
    environment_id: Uuid,
    known: Option<Uuid>,
) -> Result<Uuid> {
    if let Some(id) = known {
        return Ok(id);
    }
    match heartbeats.find(environment_id).await? {
        Some(id) => Ok(id),
        None => Ok(heartbeats.create(environment_id).await?),
    }
}

/// Delete a resource, treating an already-missing resource as deleted.
pub async fn delete_resource(
    broker: &dyn ResourceBroker,
    environment_id: Uuid,
    resource: &ResourceRef,
) -> std::result::Result<(), BrokerError> {
    match broker.delete(environment_id, resource.resource_id).await {
        Ok(()) | Err(BrokerError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
