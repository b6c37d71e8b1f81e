// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation queue transports.
//!
//! Queues deliver at least once: a pulled message stays invisible for the visibility
//! timeout and reappears unless it is completed. Consumers must tolerate redelivery.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::{ContinuationQueuePayload, ContinuationTarget};
use crate::error::Result;

pub use memory::{InMemoryCrossRegionQueue, InMemoryQueue};
pub use postgres::{PostgresCrossRegionQueue, PostgresQueue};

/// Proof of a pulled message, needed to complete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageReceipt {
    /// Queue-assigned message id.
    pub message_id: i64,
    /// Changes on every delivery; a stale receipt cannot complete a redelivered message.
    pub pop_receipt: Uuid,
}

/// A pulled message.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    /// Receipt for [`ContinuationQueue::complete`].
    pub receipt: MessageReceipt,
    /// The continuation.
    pub payload: ContinuationQueuePayload<T>,
    /// How many times the message has been delivered, this delivery included.
    pub dequeue_count: u32,
}

/// The regional continuation queue.
#[async_trait]
pub trait ContinuationQueue<T: ContinuationTarget>: Send + Sync {
    /// Enqueue a payload, invisible until `delay` has elapsed.
    async fn push(&self, payload: ContinuationQueuePayload<T>, delay: Duration) -> Result<()>;

    /// Lease up to `max` visible messages for `visibility_timeout`.
    async fn pull(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<QueuedMessage<T>>>;

    /// Remove a pulled message. Returns false when the receipt is stale.
    async fn complete(&self, receipt: &MessageReceipt) -> Result<bool>;
}

/// Transport to the continuation queue of another control-plane region.
#[async_trait]
pub trait CrossRegionQueue<T: ContinuationTarget>: Send + Sync {
    /// Enqueue a payload on `region`'s queue.
    async fn push_to_region(
        &self,
        region: &str,
        payload: ContinuationQueuePayload<T>,
        delay: Duration,
    ) -> Result<()>;
}
