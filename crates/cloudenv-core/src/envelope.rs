// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation envelope and result types.
//!
//! A [`ContinuationQueuePayload`] is the unit that travels through the queue. It names the
//! [`ContinuationTarget`] that owns it, carries the serialized phase input, and counts the
//! steps taken so far. Handlers answer each step with a [`ContinuationResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::identity::Identity;

/// Outcome classification of a single continuation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// More work pending; the result carries the next input.
    InProgress,
    /// Workflow finished successfully.
    Succeeded,
    /// Workflow finished unsuccessfully.
    Failed,
    /// Workflow abandoned because the aggregate moved on without it.
    Cancelled,
}

impl OperationState {
    /// Whether this state ends the workflow.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Stable string form, used in logs and persisted rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed set of workflow kinds that continuations can be routed to.
///
/// Implementors are plain fieldless enums. `all()` must list every variant so the
/// registry can prove that each target has exactly one handler at startup.
pub trait ContinuationTarget:
    Copy + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Every variant of the target enum.
    fn all() -> &'static [Self];

    /// Stable string encoding, used on the wire and in logs.
    fn as_str(&self) -> &'static str;
}

/// What a handler returns for one step.
///
/// `next_input` is only meaningful while `status` is [`OperationState::InProgress`]; the
/// activator re-enqueues it under the same target after `retry_after`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationResult<I> {
    /// Classification of the step.
    pub status: OperationState,
    /// Input for the next step.
    pub next_input: Option<I>,
    /// Delay before the next step becomes visible.
    pub retry_after: Duration,
    /// Short machine-readable reason for failed and cancelled outcomes.
    pub error_reason: Option<String>,
}

impl<I> ContinuationResult<I> {
    /// Continue immediately with `next`.
    pub fn in_progress(next: I) -> Self {
        Self::in_progress_after(next, Duration::ZERO)
    }

    /// Continue with `next` once `retry_after` has elapsed.
    pub fn in_progress_after(next: I, retry_after: Duration) -> Self {
        Self {
            status: OperationState::InProgress,
            next_input: Some(next),
            retry_after,
            error_reason: None,
        }
    }

    /// Finish successfully.
    pub fn succeeded() -> Self {
        Self::terminal(OperationState::Succeeded, None)
    }

    /// Finish unsuccessfully with a short reason such as `"Timeout"`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::terminal(OperationState::Failed, Some(reason.into()))
    }

    /// Abandon the workflow with a short reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::terminal(OperationState::Cancelled, Some(reason.into()))
    }

    fn terminal(status: OperationState, error_reason: Option<String>) -> Self {
        Self {
            status,
            next_input: None,
            retry_after: Duration::ZERO,
            error_reason,
        }
    }

    /// Whether the workflow ends with this result.
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Check the result contract: an in-progress result must carry a next input.
    pub fn validate(&self) -> Result<()> {
        if self.status == OperationState::InProgress && self.next_input.is_none() {
            return Err(CoreError::ContractViolation {
                reason: "in-progress result without next input".to_string(),
            });
        }
        Ok(())
    }

    /// Transform the next input, keeping everything else.
    pub fn map_input<J>(self, f: impl FnOnce(I) -> J) -> ContinuationResult<J> {
        ContinuationResult {
            status: self.status,
            next_input: self.next_input.map(f),
            retry_after: self.retry_after,
            error_reason: self.error_reason,
        }
    }

    /// Fallible version of [`Self::map_input`].
    pub fn try_map_input<J, E>(
        self,
        f: impl FnOnce(I) -> std::result::Result<J, E>,
    ) -> std::result::Result<ContinuationResult<J>, E> {
        Ok(ContinuationResult {
            status: self.status,
            next_input: self.next_input.map(f).transpose()?,
            retry_after: self.retry_after,
            error_reason: self.error_reason,
        })
    }
}

/// The message that travels through the continuation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationQueuePayload<T> {
    /// Correlation id shared by every step of one workflow run.
    pub tracking_id: Uuid,
    /// Id of this particular step.
    pub tracking_instance_id: Uuid,
    /// Which handler owns the payload.
    pub target: T,
    /// Serialized phase input.
    pub input: serde_json::Value,
    /// Identity that submitted the workflow.
    #[serde(default)]
    pub identity: Identity,
    /// When the workflow was first submitted.
    pub created: DateTime<Utc>,
    /// Number of steps completed before this one.
    pub step_count: u32,
    /// Status of the step that produced this payload.
    #[serde(default)]
    pub status: Option<OperationState>,
    /// Delay that was requested before this step.
    #[serde(with = "duration_millis", default)]
    pub retry_after: Duration,
    /// Consecutive faulted attempts of this step.
    #[serde(default)]
    pub fault_count: u32,
    /// Extra fields attached to every log line of the workflow.
    #[serde(default)]
    pub logger_properties: BTreeMap<String, String>,
}

impl<T: ContinuationTarget> ContinuationQueuePayload<T> {
    /// Start a new workflow run.
    pub fn new(target: T, input: serde_json::Value, identity: Identity) -> Self {
        Self {
            tracking_id: Uuid::new_v4(),
            tracking_instance_id: Uuid::new_v4(),
            target,
            input,
            identity,
            created: Utc::now(),
            step_count: 0,
            status: None,
            retry_after: Duration::ZERO,
            fault_count: 0,
            logger_properties: BTreeMap::new(),
        }
    }

    /// Attach a log property carried by every later step.
    pub fn with_logger_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.logger_properties.insert(key.into(), value.into());
        self
    }

    /// Build the payload for the step after this one.
    pub fn next_step(&self, input: serde_json::Value, retry_after: Duration) -> Self {
        Self {
            tracking_id: self.tracking_id,
            tracking_instance_id: Uuid::new_v4(),
            target: self.target,
            input,
            identity: self.identity.clone(),
            created: self.created,
            step_count: self.step_count + 1,
            status: Some(OperationState::InProgress),
            retry_after,
            fault_count: 0,
            logger_properties: self.logger_properties.clone(),
        }
    }

    /// Build a retry of this same step after a fault.
    pub fn fault_retry(&self, retry_after: Duration) -> Self {
        Self {
            tracking_instance_id: Uuid::new_v4(),
            retry_after,
            fault_count: self.fault_count + 1,
            ..self.clone()
        }
    }

    /// Time elapsed since the workflow was first submitted.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
