// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repair: force-suspend an unhealthy environment.

use std::sync::Arc;

use async_trait::async_trait;
use cloudenv_core::{
    ContinuationResult, DispatchContext, Elevation, HandlerError, OperationState, PhaseHandler,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::reasons;
use crate::providers::EnvironmentManager;
use crate::target::EnvironmentTarget;

/// Input of `repair-environment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairEnvironmentInput {
    /// Environment to repair.
    pub environment_id: Uuid,
    /// Why.
    pub reason: String,
}

/// Handler for `repair-environment`. Runs as superuser.
pub struct RepairEnvironmentHandler {
    manager: Arc<dyn EnvironmentManager>,
}

impl RepairEnvironmentHandler {
    /// Build around the environment manager.
    pub fn new(manager: Arc<dyn EnvironmentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PhaseHandler<EnvironmentTarget> for RepairEnvironmentHandler {
    type Input = RepairEnvironmentInput;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::RepairEnvironment
    }

    fn name(&self) -> &'static str {
        "RepairEnvironment"
    }

    fn elevation(&self) -> Elevation {
        Elevation::Superuser
    }

    async fn continue_phase(
        &self,
        input: RepairEnvironmentInput,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<RepairEnvironmentInput>, HandlerError> {
        let environment_id = input.environment_id;
        match self.manager.force_suspend(environment_id, &ctx.identity).await {
            Ok(OperationState::Succeeded) => {
                info!(%environment_id, reason = %input.reason, "Environment repaired");
                Ok(ContinuationResult::succeeded())
            }
            Ok(status) => {
                warn!(%environment_id, %status, "Forced suspend did not succeed");
                Ok(ContinuationResult::failed(reasons::REPAIR_FAILED))
            }
            Err(e) => {
                warn!(%environment_id, error = %e, "Forced suspend failed");
                Ok(ContinuationResult::failed(reasons::REPAIR_FAILED))
            }
        }
    }
}
