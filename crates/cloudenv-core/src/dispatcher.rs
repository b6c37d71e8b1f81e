// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routes a payload to its handler and runs one step.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

use crate::envelope::{ContinuationQueuePayload, ContinuationResult, ContinuationTarget};
use crate::handler::{DispatchContext, HandlerError, INVALID_INPUT_TYPE, NO_HANDLER_FOUND};
use crate::identity::IdentityScope;
use crate::registry::HandlerRegistry;

/// Default age after which a workflow is no longer dispatched.
pub const DEFAULT_MAX_WORKFLOW_AGE: Duration = Duration::from_secs(60 * 60);

/// Why a step produced no usable result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The handler returned an error.
    #[error("handler '{handler}' failed: {source}")]
    Handler {
        /// Handler name.
        handler: &'static str,
        /// The handler's error.
        #[source]
        source: HandlerError,
    },

    /// The handler panicked.
    #[error("handler '{handler}' panicked: {message}")]
    Panicked {
        /// Handler name.
        handler: &'static str,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The handler returned a result that breaks the contract.
    #[error("handler '{handler}' violated the result contract: {reason}")]
    ContractViolation {
        /// Handler name.
        handler: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The workflow outlived the maximum workflow age.
    #[error("workflow expired after {age:?}")]
    Expired {
        /// Age of the workflow.
        age: Duration,
    },
}

impl DispatchError {
    /// Whether repeating the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handler { .. } | Self::Panicked { .. })
    }
}

/// Runs one continuation step against the registry.
pub struct Dispatcher<T> {
    registry: Arc<HandlerRegistry<T>>,
    max_workflow_age: Duration,
}

impl<T: ContinuationTarget> Dispatcher<T> {
    /// Create a dispatcher with the default maximum workflow age.
    pub fn new(registry: Arc<HandlerRegistry<T>>) -> Self {
        Self {
            registry,
            max_workflow_age: DEFAULT_MAX_WORKFLOW_AGE,
        }
    }

    /// Override the maximum workflow age.
    pub fn with_max_workflow_age(mut self, age: Duration) -> Self {
        self.max_workflow_age = age;
        self
    }

    /// The registry this dispatcher routes through.
    pub fn registry(&self) -> &HandlerRegistry<T> {
        &self.registry
    }

    /// Run one step of `payload`.
    ///
    /// A payload is expired once older than the larger of the maximum workflow age and
    /// the handler's own [`max_workflow_age`](crate::PhaseHandler::max_workflow_age).
    /// The handler runs under its effective identity, entered into `scope` for the
    /// duration of the call. A missing handler yields `Failed("NoHandlerFound")`.
    /// A temporarily unavailable dependency yields an in-progress result repeating the
    /// same input.
    pub async fn dispatch(
        &self,
        payload: &ContinuationQueuePayload<T>,
        scope: &IdentityScope,
    ) -> Result<ContinuationResult<serde_json::Value>, DispatchError> {
        let Some(handler) = self.registry.resolve(payload.target) else {
            warn!(
                workflow = payload.target.as_str(),
                tracking_id = %payload.tracking_id,
                "No handler registered for continuation target"
            );
            return Ok(ContinuationResult::failed(NO_HANDLER_FOUND));
        };
        let name = handler.name();

        let max_age = handler
            .max_workflow_age()
            .map_or(self.max_workflow_age, |age| age.max(self.max_workflow_age));
        let age = payload.age(Utc::now());
        if age > max_age {
            return Err(DispatchError::Expired { age });
        }

        let identity = handler.elevation().effective(&payload.identity);
        let ctx = DispatchContext {
            tracking_id: payload.tracking_id,
            tracking_instance_id: payload.tracking_instance_id,
            step_count: payload.step_count,
            identity: identity.clone(),
            submitted_by: payload.identity.clone(),
        };

        let span = info_span!(
            "continuation",
            workflow = payload.target.as_str(),
            tracking_id = %payload.tracking_id,
            step = payload.step_count,
            properties = ?payload.logger_properties,
        );

        let outcome = {
            let _guard = scope.enter(identity);
            AssertUnwindSafe(handler.continue_json(payload.input.clone(), &ctx))
                .catch_unwind()
                .instrument(span)
                .await
        };

        let result = match outcome {
            Err(panic) => {
                return Err(DispatchError::Panicked {
                    handler: name,
                    message: panic_message(panic.as_ref()),
                });
            }
            Ok(Err(HandlerError::TemporarilyUnavailable {
                retry_after,
                message,
            })) => {
                debug!(
                    handler = name,
                    tracking_id = %payload.tracking_id,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    %message,
                    "Dependency temporarily unavailable, repeating step"
                );
                return Ok(ContinuationResult::in_progress_after(
                    payload.input.clone(),
                    retry_after,
                ));
            }
            Ok(Err(HandlerError::InvalidInput(message))) => {
                warn!(handler = name, tracking_id = %payload.tracking_id, %message, "Handler rejected input");
                return Ok(ContinuationResult::failed(INVALID_INPUT_TYPE));
            }
            Ok(Err(source)) => {
                return Err(DispatchError::Handler {
                    handler: name,
                    source,
                });
            }
            Ok(Ok(result)) => result,
        };

        if let Err(e) = result.validate() {
            return Err(DispatchError::ContractViolation {
                handler: name,
                reason: e.to_string(),
            });
        }
        if result.retry_after.is_zero() && result.next_input.as_ref() == Some(&payload.input) {
            return Err(DispatchError::ContractViolation {
                handler: name,
                reason: "in-progress result repeats its input with no delay".to_string(),
            });
        }

        Ok(result)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
