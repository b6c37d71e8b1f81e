// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The phase handler contract.
//!
//! A [`PhaseHandler`] runs exactly one phase of a workflow per call and reports what should
//! happen next through a [`ContinuationResult`]. Handlers are written against a typed
//! `Input`; the registry stores them type-erased behind JSON so one queue can carry every
//! workflow kind.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{ContinuationResult, ContinuationTarget};
use crate::identity::{Elevation, Identity};

/// Failure reason reported when a payload input does not match the handler's input type.
pub const INVALID_INPUT_TYPE: &str = "InvalidInputType";

/// Failure reason reported when no handler is registered for a target.
pub const NO_HANDLER_FOUND: &str = "NoHandlerFound";

/// Per-step information handed to a handler alongside its input.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Correlation id of the workflow run.
    pub tracking_id: Uuid,
    /// Id of this step.
    pub tracking_instance_id: Uuid,
    /// Steps completed before this one.
    pub step_count: u32,
    /// Identity the handler runs under (after elevation).
    pub identity: Identity,
    /// Identity that submitted the workflow.
    pub submitted_by: Identity,
}

/// Errors a handler can raise instead of returning a result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// A dependency is briefly unavailable; the same input is retried after `retry_after`.
    #[error("temporarily unavailable, retry after {retry_after:?}: {message}")]
    TemporarilyUnavailable {
        /// Delay before retrying.
        retry_after: Duration,
        /// What was unavailable.
        message: String,
    },

    /// The input could not be interpreted by the handler.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other failure. The activator retries these with backoff.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Wrap an arbitrary error.
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }
}

/// Handles every phase of one workflow kind.
#[async_trait]
pub trait PhaseHandler<T: ContinuationTarget>: Send + Sync + 'static {
    /// Serialized phase input. Must be self-contained: resuming a workflow needs nothing else.
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The target this handler owns.
    fn target(&self) -> T;

    /// Name used in logs and registry errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Whether this handler owns `target`. Must be a pure tag comparison.
    fn can_handle(&self, target: T) -> bool {
        target == self.target()
    }

    /// Privilege this handler runs with.
    fn elevation(&self) -> Elevation {
        Elevation::Caller
    }

    /// How long a workflow of this kind may run, measured from its first submission.
    ///
    /// The dispatcher applies the larger of this and its own maximum workflow age.
    fn max_workflow_age(&self) -> Option<Duration> {
        None
    }

    /// Run one phase.
    async fn continue_phase(
        &self,
        input: Self::Input,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<Self::Input>, HandlerError>;
}

/// Object-safe view of a [`PhaseHandler`] with JSON input.
#[async_trait]
pub(crate) trait ErasedHandler<T>: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, target: T) -> bool;
    fn elevation(&self) -> Elevation;
    fn max_workflow_age(&self) -> Option<Duration>;
    async fn continue_json(
        &self,
        input: serde_json::Value,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<serde_json::Value>, HandlerError>;
}

pub(crate) struct Erased<H>(pub(crate) H);

#[async_trait]
impl<T, H> ErasedHandler<T> for Erased<H>
where
    T: ContinuationTarget,
    H: PhaseHandler<T>,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn can_handle(&self, target: T) -> bool {
        self.0.can_handle(target)
    }

    fn elevation(&self) -> Elevation {
        self.0.elevation()
    }

    fn max_workflow_age(&self) -> Option<Duration> {
        self.0.max_workflow_age()
    }

    async fn continue_json(
        &self,
        input: serde_json::Value,
        ctx: &DispatchContext,
    ) -> Result<ContinuationResult<serde_json::Value>, HandlerError> {
        let typed: H::Input = match serde_json::from_value(input) {
            Ok(typed) => typed,
            Err(e) => {
                warn!(
                    handler = self.0.name(),
                    tracking_id = %ctx.tracking_id,
                    error = %e,
                    "Continuation input does not match handler input type"
                );
                return Ok(ContinuationResult::failed(INVALID_INPUT_TYPE));
            }
        };

        self.0
            .continue_phase(typed, ctx)
            .await?
            .try_map_input(serde_json::to_value)
            .map_err(HandlerError::other)
    }
}
