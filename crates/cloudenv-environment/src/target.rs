// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation targets for environment workflows.

use std::fmt;

use cloudenv_core::ContinuationTarget;
use serde::{Deserialize, Serialize};

/// Every environment workflow kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentTarget {
    /// Provision a new environment.
    CreateEnvironment,
    /// Resume a shut-down environment.
    StartEnvironment,
    /// Start an environment to export it.
    ExportEnvironment,
    /// Release an environment's compute.
    ShutdownEnvironment,
    /// Move a shut-down environment's storage to cold storage.
    ArchiveEnvironment,
    /// Ask the environment manager to suspend an environment.
    SuspendEnvironment,
    /// Delete an environment's resources.
    DeleteEnvironment,
    /// Force an unhealthy environment back to a known state.
    RepairEnvironment,
}

impl ContinuationTarget for EnvironmentTarget {
    fn all() -> &'static [Self] {
        &[
            Self::CreateEnvironment,
            Self::StartEnvironment,
            Self::ExportEnvironment,
            Self::ShutdownEnvironment,
            Self::ArchiveEnvironment,
            Self::SuspendEnvironment,
            Self::DeleteEnvironment,
            Self::RepairEnvironment,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::CreateEnvironment => "create-environment",
            Self::StartEnvironment => "start-environment",
            Self::ExportEnvironment => "export-environment",
            Self::ShutdownEnvironment => "shutdown-environment",
            Self::ArchiveEnvironment => "archive-environment",
            Self::SuspendEnvironment => "suspend-environment",
            Self::DeleteEnvironment => "delete-environment",
            Self::RepairEnvironment => "repair-environment",
        }
    }
}

impl fmt::Display for EnvironmentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name_matches_as_str() {
        for target in EnvironmentTarget::all() {
            let wire = serde_json::to_value(target).unwrap();
            assert_eq!(wire, serde_json::Value::String(target.as_str().to_string()));
        }
    }
}
