// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspend: one call to the environment manager.

use std::sync::Arc;

use async_trait::async_trait;
use cloudenv_core::{
    ContinuationResult, DispatchContext, Elevation, HandlerError, OperationState, PhaseHandler,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::reasons;
use crate::providers::{EnvironmentManager, ProviderError};
use crate::target::EnvironmentTarget;

/// Input of `suspend-environment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendEnvironmentInput {
    /// Environment to suspend.
    pub environment_id: Uuid,
    /// Why.
    pub reason: String,
}

/// Handler for `suspend-environment`. Runs as superuser.
pub struct SuspendEnvironmentHandler {
    manager: Arc<dyn EnvironmentManager>,
}

impl SuspendEnvironmentHandler {
    /// Build around the environment manager.
    pub fn new(manager: Arc<dyn EnvironmentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PhaseHandler<EnvironmentTarget> for SuspendEnvironmentHandler {
    type Input = SuspendEnvironmentInput;

    fn target(&self) -> EnvironmentTarget {
        EnvironmentTarget::SuspendEnvironment
    }

    fn name(&self) -> &'static str {
        "SuspendEnvironment"
    }

    fn elevation(&self) -> Elevation {
        Elevation::Superuser
    }

    async fn continue_phase(
        &self,
        input: SuspendEnvironmentInput,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<SuspendEnvironmentInput>, HandlerError> {
        let environment_id = input.environment_id;
        match self.manager.suspend(environment_id, &ctx.identity).await {
            Ok(OperationState::Succeeded) => {
                info!(%environment_id, reason = %input.reason, "Environment suspended");
                Ok(ContinuationResult::succeeded())
            }
            Ok(status) => {
                warn!(%environment_id, %status, "Suspend did not succeed");
                Ok(ContinuationResult::failed(reasons::SUSPENSION_FAILED))
            }
            Err(e @ ProviderError::Unavailable { .. }) => Err(crate::Error::from(e).into()),
            Err(e) => {
                warn!(%environment_id, error = %e, "Suspend failed");
                Ok(ContinuationResult::failed(reasons::SUSPENSION_FAILED))
            }
        }
    }
}
