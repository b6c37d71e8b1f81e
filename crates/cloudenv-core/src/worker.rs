// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation queue worker.
//!
//! Pulls batches from the regional queue and activates each message. A message is
//! completed once its step has been dispatched and the follow-up enqueued; if activation
//! fails the message is left alone and reappears after the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::activator::{ActivationOutcome, ContinuationActivator};
use crate::envelope::ContinuationTarget;
use crate::error::Result;
use crate::identity::{Identity, IdentityScope};
use crate::queue::{ContinuationQueue, QueuedMessage};

/// Configuration for the continuation worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent activations.
    pub concurrency: usize,
    /// Maximum messages pulled at once.
    pub batch_size: usize,
    /// Interval between polls when the queue was empty.
    pub poll_interval: Duration,
    /// How long a pulled message stays invisible.
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is dropped as poison.
    pub max_dequeue_count: u32,
    /// Identity the worker itself runs under between activations.
    pub identity: Identity,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_size: 16,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
            max_dequeue_count: 10,
            identity: Identity::service("continuation-worker"),
        }
    }
}

/// Background worker draining the continuation queue.
pub struct ContinuationWorker<T> {
    activator: Arc<ContinuationActivator<T>>,
    queue: Arc<dyn ContinuationQueue<T>>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl<T: ContinuationTarget> ContinuationWorker<T> {
    /// Create a worker pulling from the activator's local queue.
    pub fn new(activator: Arc<ContinuationActivator<T>>, config: WorkerConfig) -> Self {
        let queue = Arc::clone(activator.submitter().queue());
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            activator,
            queue,
            config,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to trigger shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled. In-flight activations finish first.
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Continuation worker started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Activation task failed to join");
                }
            }

            let pulled = if self.permits.available_permits() == 0 {
                0
            } else {
                match self.pull_into(&mut in_flight).await {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "Failed to pull continuations");
                        0
                    }
                }
            };

            // Poll again right away while the queue keeps yielding work.
            let delay = if pulled > 0 {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Continuation worker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Activation task failed to join");
            }
        }
        info!("Continuation worker stopped");
    }

    /// Pull one batch and activate every message in it. Returns the number pulled.
    pub async fn run_once(&self) -> Result<usize> {
        let mut in_flight = JoinSet::new();
        let pulled = self.pull_into(&mut in_flight).await?;
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Activation task failed to join");
            }
        }
        Ok(pulled)
    }

    async fn pull_into(&self, in_flight: &mut JoinSet<()>) -> Result<usize> {
        let capacity = self.permits.available_permits().min(self.config.batch_size.max(1));
        let messages = self
            .queue
            .pull(capacity, self.config.visibility_timeout)
            .await?;
        let pulled = messages.len();

        for message in messages {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let activator = Arc::clone(&self.activator);
            let queue = Arc::clone(&self.queue);
            let config = self.config.clone();
            in_flight.spawn(async move {
                process_message(&activator, queue.as_ref(), &config, message).await;
                drop(permit);
            });
        }
        Ok(pulled)
    }
}

async fn process_message<T: ContinuationTarget>(
    activator: &ContinuationActivator<T>,
    queue: &dyn ContinuationQueue<T>,
    config: &WorkerConfig,
    message: QueuedMessage<T>,
) {
    let workflow = message.payload.target.as_str();
    let tracking_id = message.payload.tracking_id;

    if message.dequeue_count > config.max_dequeue_count {
        error!(
            workflow,
            %tracking_id,
            dequeue_count = message.dequeue_count,
            "Dropping continuation delivered too many times"
        );
        complete(queue, &message).await;
        return;
    }

    let scope = IdentityScope::new(config.identity.clone());
    match activator.activate(&message.payload, &scope).await {
        Ok(outcome) => {
            if let ActivationOutcome::Abandoned { .. } = outcome {
                debug!(workflow, %tracking_id, "Completing abandoned continuation");
            }
            complete(queue, &message).await;
        }
        Err(e) => {
            warn!(
                workflow,
                %tracking_id,
                error = %e,
                "Failed to enqueue follow-up, leaving continuation for redelivery"
            );
        }
    }
}

async fn complete<T: ContinuationTarget>(queue: &dyn ContinuationQueue<T>, message: &QueuedMessage<T>) {
    match queue.complete(&message.receipt).await {
        Ok(true) => {}
        Ok(false) => warn!(
            tracking_id = %message.payload.tracking_id,
            "Continuation receipt expired before completion"
        ),
        Err(e) => error!(
            tracking_id = %message.payload.tracking_id,
            error = %e,
            "Failed to complete continuation"
        ),
    }
}
