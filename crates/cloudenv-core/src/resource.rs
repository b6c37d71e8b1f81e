// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! References to infrastructure resources held by workflows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of infrastructure resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Virtual machine running the environment.
    ComputeVm,
    /// Operating system disk.
    OsDisk,
    /// Live file share holding the workspace.
    StorageFileShare,
    /// Cold blob holding an archived workspace.
    StorageArchive,
    /// Snapshot of an OS disk.
    Snapshot,
}

impl ResourceType {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComputeVm => "compute_vm",
            Self::OsDisk => "os_disk",
            Self::StorageFileShare => "storage_file_share",
            Self::StorageArchive => "storage_archive",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value handle to an allocated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Broker-assigned id.
    pub resource_id: Uuid,
    /// Data-plane location the resource lives in.
    pub location: String,
    /// Size/class of the resource.
    pub sku_name: String,
    /// When the broker allocated it.
    pub created_at: DateTime<Utc>,
    /// Kind of resource.
    pub resource_type: ResourceType,
}

impl ResourceRef {
    /// Create a reference for a freshly allocated resource.
    pub fn new(
        resource_type: ResourceType,
        location: impl Into<String>,
        sku_name: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: Uuid::new_v4(),
            location: location.into(),
            sku_name: sku_name.into(),
            created_at: Utc::now(),
            resource_type,
        }
    }

    /// Whether two references point at the same resource.
    pub fn same_resource(&self, other: &ResourceRef) -> bool {
        self.resource_id == other.resource_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ref_serializes_type_as_snake_case() {
        let r = ResourceRef::new(ResourceType::StorageFileShare, "westus2", "Standard_64GB");
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["resource_type"], "storage_file_share");
        assert_eq!(value["location"], "westus2");
    }

    #[test]
    fn test_same_resource_compares_ids() {
        let a = ResourceRef::new(ResourceType::ComputeVm, "westus2", "basicLinux");
        let mut b = a.clone();
        b.sku_name = "premiumLinux".into();
        assert!(a.same_resource(&b));
        assert!(!a.same_resource(&ResourceRef::new(ResourceType::ComputeVm, "westus2", "basicLinux")));
    }
}
