// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared driver for the multi-phase environment workflows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloudenv_core::{
    ContinuationResult, DispatchContext, Elevation, HandlerError, OperationState, PhaseHandler,
};
use tracing::{debug, info, warn};

use super::phase::{Phase, WorkflowInput, total_budget};
use super::reasons;
use super::record::EnvironmentRecord;
use crate::error::Result;
use crate::model::EnvironmentOperation;
use crate::providers::{EnvironmentRepository, RepositoryError};
use crate::target::EnvironmentTarget;

/// Time a workflow may spend outside its polling budgets: requeue delays, outages
/// and the phases without a budget.
pub const WORKFLOW_AGE_SLACK: Duration = Duration::from_secs(60 * 60);

/// Result type of one workflow phase.
pub type PhaseResult<P> = Result<ContinuationResult<WorkflowInput<P>>>;

/// One multi-phase workflow over an environment.
///
/// [`WorkflowHandler`] loads the environment, enforces phase budgets, records the
/// operation's progress on the aggregate and runs [`Self::on_failed`] when the
/// workflow fails.
#[async_trait]
pub trait EnvironmentWorkflow: Send + Sync + 'static {
    /// Phase enum.
    type Phase: Phase;

    /// Target this workflow handles.
    fn target(&self) -> EnvironmentTarget;

    /// Operation tracked on the aggregate.
    fn operation(&self) -> EnvironmentOperation;

    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Privilege the workflow runs with.
    fn elevation(&self) -> Elevation {
        Elevation::Caller
    }

    /// Run `input.current_state`.
    async fn run_phase(
        &self,
        input: WorkflowInput<Self::Phase>,
        record: &mut EnvironmentRecord<'_>,
        ctx: &DispatchContext,
    ) -> PhaseResult<Self::Phase>;

    /// Compensate after the workflow failed in `input.current_state`.
    async fn on_failed(
        &self,
        _input: &WorkflowInput<Self::Phase>,
        _record: &mut EnvironmentRecord<'_>,
        _ctx: &DispatchContext,
    ) -> Result<()> {
        Ok(())
    }
}

/// Adapts an [`EnvironmentWorkflow`] to [`PhaseHandler`].
pub struct WorkflowHandler<W> {
    workflow: W,
    repository: Arc<dyn EnvironmentRepository>,
}

impl<W: EnvironmentWorkflow> WorkflowHandler<W> {
    /// Wrap a workflow.
    pub fn new(workflow: W, repository: Arc<dyn EnvironmentRepository>) -> Self {
        Self {
            workflow,
            repository,
        }
    }

    /// The wrapped workflow.
    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    async fn step(
        &self,
        input: WorkflowInput<W::Phase>,
        ctx: &DispatchContext,
    ) -> PhaseResult<W::Phase> {
        let environment_id = input.environment_id;
        let phase = input.current_state;

        let mut record =
            match EnvironmentRecord::load(self.repository.as_ref(), environment_id, &ctx.identity)
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(workflow = self.workflow.name(), %environment_id, "Environment not found");
                    return Ok(ContinuationResult::failed(reasons::ENVIRONMENT_NOT_FOUND));
                }
                Err(RepositoryError::Forbidden(_)) => {
                    warn!(workflow = self.workflow.name(), %environment_id, identity = ?ctx.identity, "Access to environment denied");
                    return Ok(ContinuationResult::failed(reasons::ACCESS_DENIED));
                }
                Err(e) => return Err(e.into()),
            };

        let result = if input.budget_exceeded(Utc::now()) {
            warn!(
                workflow = self.workflow.name(),
                %environment_id,
                phase = phase.as_str(),
                entered_at = %input.phase_entered_at,
                "Phase exceeded its budget"
            );
            ContinuationResult::failed(reasons::TIMEOUT)
        } else {
            self.workflow
                .run_phase(input.clone(), &mut record, ctx)
                .await?
        };

        if result.status == OperationState::Failed
            && let Err(e) = self.workflow.on_failed(&input, &mut record, ctx).await
        {
            warn!(
                workflow = self.workflow.name(),
                %environment_id,
                phase = phase.as_str(),
                error = %e,
                "Failure cleanup did not complete"
            );
        }

        self.track(&mut record, &result, ctx).await;

        match result.status {
            OperationState::InProgress => debug!(
                workflow = self.workflow.name(),
                %environment_id,
                from = phase.as_str(),
                to = result.next_input.as_ref().map(|n| n.current_state.as_str()),
                retry_after_ms = u64::try_from(result.retry_after.as_millis()).unwrap_or(u64::MAX),
                "Phase complete"
            ),
            status => info!(
                workflow = self.workflow.name(),
                %environment_id,
                phase = phase.as_str(),
                status = %status,
                reason = result.error_reason.as_deref(),
                "Workflow finished"
            ),
        }

        Ok(result)
    }

    /// Record the operation's status on the aggregate. Best-effort: the phase's own
    /// effects are already persisted.
    async fn track(
        &self,
        record: &mut EnvironmentRecord<'_>,
        result: &ContinuationResult<WorkflowInput<W::Phase>>,
        ctx: &DispatchContext,
    ) {
        let operation = self.workflow.operation();
        let reason = result.error_reason.as_deref();
        let tracking_id = ctx.tracking_id;
        if let Err(e) = record
            .update(|env| env.record_transition(operation, result.status, reason, tracking_id))
            .await
        {
            warn!(
                workflow = self.workflow.name(),
                environment_id = %record.id,
                operation = operation.as_str(),
                error = %e,
                "Failed to record operation status"
            );
        }
    }
}

#[async_trait]
impl<W: EnvironmentWorkflow> PhaseHandler<EnvironmentTarget> for WorkflowHandler<W> {
    type Input = WorkflowInput<W::Phase>;

    fn target(&self) -> EnvironmentTarget {
        self.workflow.target()
    }

    fn name(&self) -> &'static str {
        self.workflow.name()
    }

    fn elevation(&self) -> Elevation {
        self.workflow.elevation()
    }

    /// Every polling budget plus [`WORKFLOW_AGE_SLACK`], so a phase times out through
    /// its budget before the payload expires.
    fn max_workflow_age(&self) -> Option<Duration> {
        Some(total_budget::<W::Phase>() + WORKFLOW_AGE_SLACK)
    }

    async fn continue_phase(
        &self,
        input: Self::Input,
        ctx: &DispatchContext,
    ) -> std::result::Result<ContinuationResult<Self::Input>, HandlerError> {
        self.step(input, ctx).await.map_err(HandlerError::from)
    }
}
