// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submitting workflows and driving them step by step.
//!
//! [`ContinuationSubmitter`] only needs the queues, so it can be built first and handed
//! to handlers that start follow-up workflows. [`ContinuationActivator`] is built once the
//! registry exists and turns each dispatched step into the next queue message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::envelope::{ContinuationQueuePayload, ContinuationTarget, OperationState};
use crate::error::{CoreError, Result};
use crate::identity::{Identity, IdentityScope};
use crate::queue::{ContinuationQueue, CrossRegionQueue};

/// Maps data-plane locations to the control-plane region that owns them.
pub trait RegionResolver: Send + Sync {
    /// Region this process runs in.
    fn current_region(&self) -> &str;

    /// Region owning `location`, if known.
    fn owning_region(&self, location: &str) -> Option<&str>;
}

/// Region map fixed at startup.
#[derive(Debug, Clone)]
pub struct StaticRegionMap {
    current: String,
    owners: HashMap<String, String>,
}

impl StaticRegionMap {
    /// Map with no locations; every lookup fails until locations are added.
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            owners: HashMap::new(),
        }
    }

    /// Declare that `location` is owned by `region`.
    pub fn with_location(mut self, location: impl Into<String>, region: impl Into<String>) -> Self {
        self.owners.insert(location.into(), region.into());
        self
    }
}

impl RegionResolver for StaticRegionMap {
    fn current_region(&self) -> &str {
        &self.current
    }

    fn owning_region(&self, location: &str) -> Option<&str> {
        self.owners.get(location).map(String::as_str)
    }
}

/// Enqueues new workflows.
pub struct ContinuationSubmitter<T> {
    queue: Arc<dyn ContinuationQueue<T>>,
    cross_region: Option<Arc<dyn CrossRegionQueue<T>>>,
    regions: Arc<dyn RegionResolver>,
    default_identity: Identity,
}

impl<T: ContinuationTarget> Clone for ContinuationSubmitter<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            cross_region: self.cross_region.clone(),
            regions: Arc::clone(&self.regions),
            default_identity: self.default_identity.clone(),
        }
    }
}

impl<T: ContinuationTarget> ContinuationSubmitter<T> {
    /// Create a submitter for the local queue.
    pub fn new(queue: Arc<dyn ContinuationQueue<T>>, regions: Arc<dyn RegionResolver>) -> Self {
        Self {
            queue,
            cross_region: None,
            regions,
            default_identity: Identity::service("continuation-submitter"),
        }
    }

    /// Enable submission to other regions.
    pub fn with_cross_region(mut self, cross_region: Arc<dyn CrossRegionQueue<T>>) -> Self {
        self.cross_region = Some(cross_region);
        self
    }

    /// Identity used by [`Self::submit`] and [`Self::submit_cross_region`].
    pub fn with_default_identity(mut self, identity: Identity) -> Self {
        self.default_identity = identity;
        self
    }

    /// The local queue.
    pub fn queue(&self) -> &Arc<dyn ContinuationQueue<T>> {
        &self.queue
    }

    /// The region resolver.
    pub fn regions(&self) -> &Arc<dyn RegionResolver> {
        &self.regions
    }

    /// Start a workflow on the local queue. Returns its correlation id.
    pub async fn submit<I: Serialize + Sync>(&self, target: T, input: &I) -> Result<Uuid> {
        self.submit_as(target, input, self.default_identity.clone()).await
    }

    /// Start a workflow on the local queue under `identity`.
    pub async fn submit_as<I: Serialize + Sync>(
        &self,
        target: T,
        input: &I,
        identity: Identity,
    ) -> Result<Uuid> {
        let payload = ContinuationQueuePayload::new(target, serde_json::to_value(input)?, identity);
        let tracking_id = payload.tracking_id;
        self.queue.push(payload, Duration::ZERO).await?;
        info!(workflow = target.as_str(), %tracking_id, "Submitted continuation");
        Ok(tracking_id)
    }

    /// Start a workflow in the region owning `location`.
    pub async fn submit_cross_region<I: Serialize + Sync>(
        &self,
        target: T,
        location: &str,
        input: &I,
    ) -> Result<Uuid> {
        self.submit_cross_region_as(target, location, input, self.default_identity.clone())
            .await
    }

    /// Start a workflow in the region owning `location` under `identity`.
    pub async fn submit_cross_region_as<I: Serialize + Sync>(
        &self,
        target: T,
        location: &str,
        input: &I,
        identity: Identity,
    ) -> Result<Uuid> {
        let region = self
            .regions
            .owning_region(location)
            .ok_or_else(|| CoreError::UnknownLocation {
                location: location.to_string(),
            })?;

        if region == self.regions.current_region() {
            return self.submit_as(target, input, identity).await;
        }

        let cross_region = self
            .cross_region
            .as_ref()
            .ok_or_else(|| CoreError::CrossRegionUnavailable {
                region: region.to_string(),
            })?;
        let payload = ContinuationQueuePayload::new(target, serde_json::to_value(input)?, identity)
            .with_logger_property("location", location);
        let tracking_id = payload.tracking_id;
        cross_region
            .push_to_region(region, payload, Duration::ZERO)
            .await?;
        info!(workflow = target.as_str(), %tracking_id, region, location, "Submitted continuation to remote region");
        Ok(tracking_id)
    }
}

/// Backoff for steps that faulted.
#[derive(Debug, Clone)]
pub struct FaultRetryPolicy {
    /// Attempts before the workflow is abandoned, the first included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for FaultRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl FaultRetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// What happened to one queue message.
#[derive(Debug)]
pub enum ActivationOutcome {
    /// The workflow continues with the next step.
    Requeued {
        /// Step number of the enqueued payload.
        step_count: u32,
        /// Delay before it becomes visible.
        delay: Duration,
    },
    /// The workflow ended.
    Completed {
        /// Terminal state.
        status: OperationState,
        /// Reason for failed and cancelled outcomes.
        error_reason: Option<String>,
    },
    /// The step faulted and was re-enqueued unchanged.
    Retrying {
        /// Retry number.
        attempt: u32,
        /// Delay before it runs again.
        delay: Duration,
        /// The fault.
        error: DispatchError,
    },
    /// The step faulted permanently; nothing further is enqueued.
    Abandoned {
        /// The fault.
        error: DispatchError,
    },
}

/// Drives workflows one step at a time.
pub struct ContinuationActivator<T> {
    dispatcher: Dispatcher<T>,
    submitter: ContinuationSubmitter<T>,
    fault_policy: FaultRetryPolicy,
}

impl<T: ContinuationTarget> ContinuationActivator<T> {
    /// Create an activator.
    pub fn new(dispatcher: Dispatcher<T>, submitter: ContinuationSubmitter<T>) -> Self {
        Self {
            dispatcher,
            submitter,
            fault_policy: FaultRetryPolicy::default(),
        }
    }

    /// Override the fault retry policy.
    pub fn with_fault_policy(mut self, policy: FaultRetryPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// The submitter sharing this activator's queues.
    pub fn submitter(&self) -> &ContinuationSubmitter<T> {
        &self.submitter
    }

    /// Start a workflow on the local queue.
    pub async fn submit<I: Serialize + Sync>(&self, target: T, input: &I) -> Result<Uuid> {
        self.submitter.submit(target, input).await
    }

    /// Start a workflow in the region owning `location`.
    pub async fn submit_cross_region<I: Serialize + Sync>(
        &self,
        target: T,
        location: &str,
        input: &I,
    ) -> Result<Uuid> {
        self.submitter.submit_cross_region(target, location, input).await
    }

    /// Run one step of `payload` and enqueue whatever comes next.
    ///
    /// An `Err` means the follow-up could not be enqueued; the caller should leave the
    /// message for redelivery.
    pub async fn activate(
        &self,
        payload: &ContinuationQueuePayload<T>,
        scope: &IdentityScope,
    ) -> Result<ActivationOutcome> {
        let workflow = payload.target.as_str();
        let tracking_id = payload.tracking_id;

        match self.dispatcher.dispatch(payload, scope).await {
            Ok(result) => match (result.status, result.next_input) {
                (OperationState::InProgress, Some(next)) => {
                    let next = payload.next_step(next, result.retry_after);
                    let step_count = next.step_count;
                    self.submitter.queue.push(next, result.retry_after).await?;
                    debug!(
                        workflow,
                        %tracking_id,
                        step = step_count,
                        delay_ms = u64::try_from(result.retry_after.as_millis()).unwrap_or(u64::MAX),
                        "Continuation requeued"
                    );
                    Ok(ActivationOutcome::Requeued {
                        step_count,
                        delay: result.retry_after,
                    })
                }
                (status, _) => {
                    info!(
                        workflow,
                        %tracking_id,
                        steps = payload.step_count + 1,
                        %status,
                        reason = result.error_reason.as_deref().unwrap_or(""),
                        "Continuation completed"
                    );
                    Ok(ActivationOutcome::Completed {
                        status,
                        error_reason: result.error_reason,
                    })
                }
            },
            Err(error) if error.is_retryable() && payload.fault_count + 1 < self.fault_policy.max_attempts => {
                let attempt = payload.fault_count + 1;
                let delay = self.fault_policy.delay_for(attempt);
                self.submitter
                    .queue
                    .push(payload.fault_retry(delay), delay)
                    .await?;
                warn!(
                    workflow,
                    %tracking_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Continuation step faulted, retrying"
                );
                Ok(ActivationOutcome::Retrying {
                    attempt,
                    delay,
                    error,
                })
            }
            Err(error) => {
                error!(
                    workflow,
                    %tracking_id,
                    step = payload.step_count,
                    faults = payload.fault_count + 1,
                    error = %error,
                    "Continuation abandoned"
                );
                Ok(ActivationOutcome::Abandoned { error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_delay_doubles_up_to_cap() {
        let policy = FaultRetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(20));
        assert_eq!(policy.delay_for(40), Duration::from_secs(20));
    }

    #[test]
    fn test_static_region_map() {
        let regions = StaticRegionMap::new("us")
            .with_location("westus2", "us")
            .with_location("westeurope", "eu");
        assert_eq!(regions.current_region(), "us");
        assert_eq!(regions.owning_region("westeurope"), Some("eu"));
        assert_eq!(regions.owning_region("mars"), None);
    }
}
